//! Call Engine
//!
//! Öffentliche Fassade des Crates: hält das Session-Register, verdrahtet
//! pro Anruf Signaling, Transport, Medien und Quality Monitor und reicht
//! Kommandos an den jeweiligen Session-Task weiter.
//!
//! Es läuft höchstens eine nicht-terminale Session gleichzeitig — ein
//! zweites `start()`/`join()` wird mit `AlreadyInCall` abgewiesen, bis die
//! laufende Session beendet ist.

use super::quality::QualityMonitor;
use super::session::{
    CallEvent, CallRole, CallState, CameraSwitchError, SessionActor, SessionCommand,
};
use crate::config::{EngineConfig, IceServerProvider, StaticIceServers};
use crate::media::{CameraFacing, MediaAccessError, MediaKind, MediaSource, RtpMediaSource};
use super::negotiator::Negotiator;
use crate::signaling::{
    CallId, SignalingAdapter, SignalingMessage, SignalingRelay, TransportError,
};
use crate::store::{CallStore, StoreError};
use crate::transport::{NegotiationError, PeerLinkFactory, WebRtcLinkFactory};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call with id {0}")]
    NoActiveCall(CallId),

    #[error("Call has no video track")]
    NoVideoTrack,

    #[error(transparent)]
    Media(#[from] MediaAccessError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    CameraSwitch(#[from] CameraSwitchError),

    #[error("Session is shutting down")]
    SessionClosed,
}

// ============================================================================
// SESSION REGISTRY
// ============================================================================

enum SessionSlot {
    /// Aufbau läuft noch (Media/Link/Subscribe stehen aus)
    Pending,
    Live(SessionHandle),
}

struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<CallState>,
}

impl SessionSlot {
    fn is_terminal(&self) -> bool {
        match self {
            SessionSlot::Pending => false,
            SessionSlot::Live(handle) => handle.state_rx.borrow().is_terminal(),
        }
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    adapter: Arc<SignalingAdapter>,
    store: Arc<dyn CallStore>,
    media: Arc<dyn MediaSource>,
    links: Arc<dyn PeerLinkFactory>,
    ice: Arc<dyn IceServerProvider>,
    config: EngineConfig,
    events: broadcast::Sender<CallEvent>,
    sessions: Mutex<HashMap<CallId, SessionSlot>>,
}

impl CallEngine {
    pub fn new(
        self_user: impl Into<String>,
        relay: Arc<dyn SignalingRelay>,
        store: Arc<dyn CallStore>,
        media: Arc<dyn MediaSource>,
        links: Arc<dyn PeerLinkFactory>,
        ice: Arc<dyn IceServerProvider>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            adapter: Arc::new(SignalingAdapter::new(relay, self_user)),
            store,
            media,
            links,
            ice,
            config,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Engine mit WebRTC-Transport, RTP-Medien und Google-STUN
    pub fn webrtc(
        self_user: impl Into<String>,
        relay: Arc<dyn SignalingRelay>,
        store: Arc<dyn CallStore>,
    ) -> Self {
        Self::new(
            self_user,
            relay,
            store,
            Arc::new(RtpMediaSource::new()),
            Arc::new(WebRtcLinkFactory::new()),
            Arc::new(StaticIceServers::default()),
            EngineConfig::default(),
        )
    }

    /// Engine-Events (Zustandswechsel, Quality-Samples)
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Aktueller Zustand eines Anrufs, `None` wenn unbekannt
    pub async fn state(&self, call_id: &CallId) -> Option<CallState> {
        let sessions = self.sessions.lock().await;
        match sessions.get(call_id) {
            Some(SessionSlot::Live(handle)) => Some(handle.state_rx.borrow().clone()),
            Some(SessionSlot::Pending) => Some(CallState::Idle),
            None => None,
        }
    }

    // ========================================================================
    // CALL SETUP
    // ========================================================================

    /// Startet einen ausgehenden Anruf: Medien holen, Offer publizieren,
    /// Session-Task spawnen. Fehler vor dem Spawn gehen direkt an den
    /// Aufrufer zurück, die Session existiert dann nicht.
    pub async fn start(&self, call_id: CallId, kind: MediaKind) -> Result<(), CallError> {
        self.claim(&call_id).await?;

        match self.open_session(call_id.clone(), kind, CallRole::Caller).await {
            Ok(handle) => {
                self.commit(&call_id, handle).await;
                Ok(())
            }
            Err(e) => {
                self.release(&call_id).await;
                Err(e)
            }
        }
    }

    /// Nimmt einen eingehenden Anruf an: Medien holen, abonnieren und auf
    /// das Offer warten (der Session-Task beantwortet es)
    pub async fn join(&self, call_id: CallId, kind: MediaKind) -> Result<(), CallError> {
        self.claim(&call_id).await?;

        match self.open_session(call_id.clone(), kind, CallRole::Callee).await {
            Ok(handle) => {
                self.commit(&call_id, handle).await;
                Ok(())
            }
            Err(e) => {
                self.release(&call_id).await;
                Err(e)
            }
        }
    }

    /// Gemeinsamer Aufbau beider Rollen; beim Caller inklusive
    /// Offer-Publish vor dem Spawn
    async fn open_session(
        &self,
        call_id: CallId,
        kind: MediaKind,
        role: CallRole,
    ) -> Result<SessionHandle, CallError> {
        self.store.mark_ringing(&call_id).await?;

        let ice_servers = self.ice.ice_servers().await;
        let (transport_tx, transport_rx) = mpsc::channel(32);
        let link = self.links.create(ice_servers, transport_tx).await?;

        // Ab hier lebt eine Peer-Verbindung; jeder Fehlerpfad vor dem
        // Spawn muss sie wieder schließen, sonst laufen ICE/DTLS weiter
        let (signal_tx, signal_rx) = mpsc::channel(64);
        let subscription = match self.adapter.subscribe(&call_id, signal_tx).await {
            Ok(subscription) => subscription,
            Err(e) => {
                link.close().await;
                return Err(e.into());
            }
        };

        let mut negotiator = Negotiator::new(link);
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (quality_tx, quality_rx) = mpsc::channel(16);

        // Medien zuletzt, damit bei jedem früheren Fehler keine Tracks
        // verwaisen
        let media = match self.media.acquire(kind, CameraFacing::Front).await {
            Ok(media) => media,
            Err(e) => {
                negotiator.link().close().await;
                return Err(e.into());
            }
        };

        if role == CallRole::Caller {
            self.set_state(&state_tx, &call_id, CallState::Ringing);

            let offer = match negotiator.create_offer(&media).await {
                Ok(offer) => offer,
                Err(e) => {
                    media.stop_all();
                    negotiator.link().close().await;
                    return Err(e.into());
                }
            };

            let message =
                SignalingMessage::offer(call_id.clone(), self.adapter.self_user(), offer);
            if let Err(e) = self.adapter.publish(message).await {
                media.stop_all();
                negotiator.link().close().await;
                return Err(e.into());
            }

            self.set_state(&state_tx, &call_id, CallState::Negotiating);
        }

        let actor = SessionActor {
            call_id: call_id.clone(),
            role,
            adapter: Arc::clone(&self.adapter),
            negotiator,
            media,
            media_source: Arc::clone(&self.media),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            state_tx,
            events: self.events.clone(),
            _subscription: subscription,
            commands: commands_rx,
            signal_rx,
            transport_rx,
            quality_tx,
            quality_rx,
            store_ended: self.store.ended_remotely(),
            monitor: QualityMonitor::new(),
            disconnect_deadline: None,
            recovery_deadline: None,
            poor_streak: 0,
            hangup_sent: false,
        };
        tokio::spawn(actor.run());

        Ok(SessionHandle {
            commands: commands_tx,
            state_rx,
        })
    }

    // ========================================================================
    // IN-CALL COMMANDS
    // ========================================================================

    /// Schaltet den lokalen Audio-Track um; liefert den neuen Zustand
    pub async fn toggle_mute(&self, call_id: &CallId) -> Result<bool, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(call_id, SessionCommand::ToggleMute(tx)).await?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    /// Schaltet den lokalen Video-Track um; Fehler bei Audio-only-Calls
    pub async fn toggle_video(&self, call_id: &CallId) -> Result<bool, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(call_id, SessionCommand::ToggleVideo(tx)).await?;
        rx.await
            .map_err(|_| CallError::SessionClosed)?
            .ok_or(CallError::NoVideoTrack)
    }

    /// Wechselt zwischen Front- und Rückkamera; bei Fehlern bleibt die
    /// bisherige Kamera aktiv und der Anruf läuft weiter
    pub async fn switch_camera(&self, call_id: &CallId) -> Result<CameraFacing, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(call_id, SessionCommand::SwitchCamera(tx)).await?;
        let switched = rx.await.map_err(|_| CallError::SessionClosed)?;
        Ok(switched?)
    }

    /// Beendet einen Anruf; idempotent, wiederholte Aufrufe sind no-ops
    pub async fn end(&self, call_id: &CallId) -> Result<(), CallError> {
        let commands = {
            let sessions = self.sessions.lock().await;
            match sessions.get(call_id) {
                Some(SessionSlot::Live(handle)) => handle.commands.clone(),
                _ => return Ok(()),
            }
        };

        let (tx, rx) = oneshot::channel();
        if commands.send(SessionCommand::End(tx)).await.is_err() {
            // Session bereits terminal
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn send_command(
        &self,
        call_id: &CallId,
        cmd: SessionCommand,
    ) -> Result<(), CallError> {
        let commands = {
            let sessions = self.sessions.lock().await;
            match sessions.get(call_id) {
                Some(SessionSlot::Live(handle)) => handle.commands.clone(),
                _ => return Err(CallError::NoActiveCall(call_id.clone())),
            }
        };

        commands
            .send(cmd)
            .await
            .map_err(|_| CallError::NoActiveCall(call_id.clone()))
    }

    // ========================================================================
    // REGISTRY
    // ========================================================================

    /// Reserviert den Slot; terminale Sessions werden dabei ausgeräumt
    async fn claim(&self, call_id: &CallId) -> Result<(), CallError> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, slot| !slot.is_terminal());

        if !sessions.is_empty() {
            return Err(CallError::AlreadyInCall);
        }

        sessions.insert(call_id.clone(), SessionSlot::Pending);
        Ok(())
    }

    async fn commit(&self, call_id: &CallId, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(call_id.clone(), SessionSlot::Live(handle));
    }

    async fn release(&self, call_id: &CallId) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(call_id);
    }

    fn set_state(&self, state_tx: &watch::Sender<CallState>, call_id: &CallId, state: CallState) {
        tracing::info!("Call {} -> {}", call_id, state);
        state_tx.send_replace(state.clone());
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: call_id.clone(),
            state,
        });
    }
}
