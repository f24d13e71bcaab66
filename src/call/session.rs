//! Call Session State Machine
//!
//! Pro Anruf läuft genau ein Actor-Task: jede Signaling-Nachricht, jedes
//! Transport-Ereignis, jedes Quality-Sample und jedes Kommando wird
//! sequenziell in diesem Task verarbeitet — keine zwei Ereignisse
//! konkurrieren auf demselben Session-Zustand.
//!
//! Der Debounce-Timer für `disconnected` und die Recovery-Obergrenze
//! gehören der State Machine; beide werden bei jedem Zustandswechsel weg
//! von `active` bzw. `recovering` verworfen, damit keine doppelten
//! Recovery-Trigger entstehen.

use super::negotiator::{NegotiationState, Negotiator};
use super::quality::{QualityLevel, QualityMonitor, QualitySample};
use crate::config::EngineConfig;
use crate::media::{CameraFacing, LocalMedia, MediaAccessError, MediaSource};
use crate::signaling::{
    CallId, SignalPayload, SignalingAdapter, SignalingMessage, Subscription,
};
use crate::store::CallStore;
use crate::transport::{LinkState, TrackReplaceError, TransportEvent};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Rolle dieser Seite im Anruf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Grund eines regulären Endes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Lokales `end()`
    LocalHangup,
    /// Hangup-Signal der Gegenseite
    RemoteHangup,
    /// Store-Update: Gegenseite hat den Datensatz beendet
    RemoteEnded,
}

/// Grund eines fatalen Abbruchs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Description-Austausch fehlgeschlagen
    Negotiation,
    /// Signaling- oder Peer-Transport unbrauchbar
    Transport,
    /// Recovery hat die Obergrenze gerissen
    RecoveryTimeout,
}

/// Lifecycle-Zustand einer Call-Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    Negotiating,
    Active,
    Recovering,
    Ended { reason: EndReason },
    Failed { reason: FailureReason },
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended { .. } | CallState::Failed { .. })
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Idle => f.write_str("idle"),
            CallState::Ringing => f.write_str("ringing"),
            CallState::Negotiating => f.write_str("negotiating"),
            CallState::Active => f.write_str("active"),
            CallState::Recovering => f.write_str("recovering"),
            CallState::Ended { .. } => f.write_str("ended"),
            CallState::Failed { .. } => f.write_str("failed"),
        }
    }
}

/// Events der Engine (Push-Modell, broadcast)
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged { call_id: CallId, state: CallState },
    Quality { call_id: CallId, sample: QualitySample },
}

#[derive(Error, Debug)]
pub enum CameraSwitchError {
    #[error("Call has no video track")]
    NoVideoTrack,

    #[error("Alternate camera unavailable: {0}")]
    Unavailable(#[from] MediaAccessError),

    #[error("Video track replace failed: {0}")]
    Replace(#[from] TrackReplaceError),
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Kommandos der Engine an den Session-Task
pub(crate) enum SessionCommand {
    ToggleMute(oneshot::Sender<bool>),
    ToggleVideo(oneshot::Sender<Option<bool>>),
    SwitchCamera(oneshot::Sender<Result<CameraFacing, CameraSwitchError>>),
    End(oneshot::Sender<()>),
}

// ============================================================================
// ACTOR
// ============================================================================

/// Ergebnis eines Event-Handlers
enum Flow {
    Continue,
    Ended,
}

/// Was den Actor geweckt hat
enum Wake {
    Command(Option<SessionCommand>),
    Signal(Option<SignalingMessage>),
    Transport(Option<TransportEvent>),
    Quality(QualitySample),
    StoreEnded(CallId),
    GraceElapsed,
    CeilingElapsed,
}

pub(crate) struct SessionActor {
    pub call_id: CallId,
    pub role: CallRole,
    pub adapter: Arc<SignalingAdapter>,
    pub negotiator: Negotiator,
    pub media: LocalMedia,
    pub media_source: Arc<dyn MediaSource>,
    pub store: Arc<dyn CallStore>,
    pub config: EngineConfig,
    pub state_tx: watch::Sender<CallState>,
    pub events: broadcast::Sender<CallEvent>,
    pub _subscription: Subscription,

    pub commands: mpsc::Receiver<SessionCommand>,
    pub signal_rx: mpsc::Receiver<SignalingMessage>,
    pub transport_rx: mpsc::Receiver<TransportEvent>,
    pub quality_tx: mpsc::Sender<QualitySample>,
    pub quality_rx: mpsc::Receiver<QualitySample>,
    pub store_ended: broadcast::Receiver<CallId>,

    pub monitor: QualityMonitor,
    pub disconnect_deadline: Option<Instant>,
    pub recovery_deadline: Option<Instant>,
    pub poor_streak: u32,
    pub hangup_sent: bool,
}

impl SessionActor {
    /// Event-Loop der Session; läuft bis zu einem terminalen Zustand
    pub async fn run(mut self) {
        tracing::info!("Session {} ({:?}) started", self.call_id, self.role);

        // Caller kommt schon verhandelnd aus `start()` heraus
        if *self.state_tx.borrow() == CallState::Negotiating {
            self.start_monitor();
        }

        loop {
            let far_future = Instant::now() + Duration::from_secs(86_400);
            let grace_at = self.disconnect_deadline.unwrap_or(far_future);
            let ceiling_at = self.recovery_deadline.unwrap_or(far_future);

            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                msg = self.signal_rx.recv() => Wake::Signal(msg),
                ev = self.transport_rx.recv() => Wake::Transport(ev),
                Some(sample) = self.quality_rx.recv() => Wake::Quality(sample),
                ended = self.store_ended.recv() => match ended {
                    Ok(id) => Wake::StoreEnded(id),
                    // Lag oder geschlossener Store-Kanal ist kein Session-Fehler
                    Err(_) => continue,
                },
                _ = tokio::time::sleep_until(grace_at), if self.disconnect_deadline.is_some() => {
                    Wake::GraceElapsed
                }
                _ = tokio::time::sleep_until(ceiling_at), if self.recovery_deadline.is_some() => {
                    Wake::CeilingElapsed
                }
            };

            let flow = match wake {
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Command(None) => {
                    // Engine weg — Session sauber abbauen
                    self.finish(EndReason::LocalHangup, true).await;
                    Flow::Ended
                }
                Wake::Signal(Some(msg)) => self.on_signal(msg).await,
                Wake::Signal(None) => {
                    // Abonnement nach initialem Erfolg verloren
                    tracing::error!("Signaling subscription for {} lost", self.call_id);
                    self.fail(FailureReason::Transport).await;
                    Flow::Ended
                }
                Wake::Transport(Some(ev)) => self.on_transport(ev).await,
                Wake::Transport(None) => {
                    tracing::error!("Transport event channel for {} closed", self.call_id);
                    self.fail(FailureReason::Transport).await;
                    Flow::Ended
                }
                Wake::Quality(sample) => self.on_quality(sample).await,
                Wake::StoreEnded(id) => {
                    if id == self.call_id {
                        tracing::info!("Call {} ended remotely via store", self.call_id);
                        self.finish(EndReason::RemoteEnded, false).await;
                        Flow::Ended
                    } else {
                        Flow::Continue
                    }
                }
                Wake::GraceElapsed => self.on_grace_elapsed().await,
                Wake::CeilingElapsed => {
                    tracing::error!(
                        "Recovery for {} exceeded ceiling of {:?}",
                        self.call_id,
                        self.config.recovery_ceiling
                    );
                    self.fail(FailureReason::RecoveryTimeout).await;
                    Flow::Ended
                }
            };

            if matches!(flow, Flow::Ended) {
                break;
            }
        }

        tracing::info!("Session {} finished: {}", self.call_id, *self.state_tx.borrow());
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn on_signal(&mut self, msg: SignalingMessage) -> Flow {
        tracing::debug!(
            "Session {} received {} from {}",
            self.call_id,
            msg.signal.kind(),
            msg.from_user
        );

        match msg.signal {
            SignalPayload::Offer(sdp) => match self.negotiator.state() {
                // Callee-Eröffnung: Offer annehmen, Answer publizieren
                NegotiationState::Idle if self.role == CallRole::Callee => {
                    let answer = match self.negotiator.accept_offer(&sdp, &self.media).await {
                        Ok(answer) => answer,
                        Err(e) => {
                            tracing::error!("Accepting offer for {} failed: {}", self.call_id, e);
                            self.fail(FailureReason::Negotiation).await;
                            return Flow::Ended;
                        }
                    };

                    if self.publish(SignalPayload::Answer(answer.clone())).await.is_err() {
                        self.fail(FailureReason::Transport).await;
                        return Flow::Ended;
                    }

                    if let Err(e) = self.store.mark_active(&self.call_id, &answer).await {
                        tracing::warn!("Marking call {} active failed: {}", self.call_id, e);
                    }

                    self.set_state(CallState::Negotiating);
                    self.start_monitor();
                    Flow::Continue
                }

                // Restart-Offer der Gegenseite auf laufender Session
                NegotiationState::Stable => {
                    match self.negotiator.accept_restart_offer(&sdp).await {
                        Ok(answer) => {
                            if self.publish(SignalPayload::Answer(answer)).await.is_err() {
                                self.fail(FailureReason::Transport).await;
                                return Flow::Ended;
                            }
                            Flow::Continue
                        }
                        Err(e) => {
                            tracing::error!("Restart offer for {} failed: {}", self.call_id, e);
                            self.fail(FailureReason::Negotiation).await;
                            Flow::Ended
                        }
                    }
                }

                // Dupliziertes Offer während laufender Verhandlung
                _ => {
                    tracing::debug!("Ignoring duplicate offer for {}", self.call_id);
                    Flow::Continue
                }
            },

            SignalPayload::Answer(sdp) => {
                if let Err(e) = self.negotiator.accept_answer(&sdp).await {
                    tracing::error!("Accepting answer for {} failed: {}", self.call_id, e);
                    self.fail(FailureReason::Negotiation).await;
                    return Flow::Ended;
                }

                // Koaleszierte Restart-Anfrage nachholen
                if self.negotiator.take_queued_restart() {
                    return self.start_ice_restart().await;
                }
                Flow::Continue
            }

            SignalPayload::IceCandidate(candidate) => {
                self.negotiator.apply_candidate(candidate).await;
                Flow::Continue
            }

            SignalPayload::Hangup => {
                self.finish(EndReason::RemoteHangup, false).await;
                Flow::Ended
            }
        }
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    async fn on_transport(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::StateChanged(LinkState::Connected) => {
                self.disconnect_deadline = None;
                self.recovery_deadline = None;
                self.poor_streak = 0;

                let state = self.state_tx.borrow().clone();
                if matches!(state, CallState::Negotiating | CallState::Recovering) {
                    self.set_state(CallState::Active);
                }
                Flow::Continue
            }

            TransportEvent::StateChanged(LinkState::Disconnected) => {
                if *self.state_tx.borrow() == CallState::Active
                    && self.disconnect_deadline.is_none()
                {
                    tracing::warn!(
                        "Call {} disconnected, grace period of {:?} running",
                        self.call_id,
                        self.config.disconnect_grace
                    );
                    self.disconnect_deadline =
                        Some(Instant::now() + self.config.disconnect_grace);
                }
                Flow::Continue
            }

            TransportEvent::StateChanged(LinkState::Failed) => {
                let state = self.state_tx.borrow().clone();
                match state {
                    // Sofortige Recovery, ohne Karenzzeit
                    CallState::Active => self.begin_recovery().await,
                    CallState::Recovering => Flow::Continue,
                    _ => {
                        tracing::error!("Transport for {} failed during {}", self.call_id, state);
                        self.fail(FailureReason::Transport).await;
                        Flow::Ended
                    }
                }
            }

            TransportEvent::StateChanged(_) => Flow::Continue,

            TransportEvent::LocalCandidate(candidate) => {
                // Verlust eines einzelnen Candidates ist nicht fatal
                if let Err(e) = self
                    .publish(SignalPayload::IceCandidate(candidate))
                    .await
                {
                    tracing::warn!("Publishing ICE candidate for {} failed: {}", self.call_id, e);
                }
                Flow::Continue
            }
        }
    }

    async fn on_grace_elapsed(&mut self) -> Flow {
        self.disconnect_deadline = None;
        if *self.state_tx.borrow() == CallState::Active {
            tracing::warn!("Call {} still disconnected after grace period", self.call_id);
            self.begin_recovery().await
        } else {
            Flow::Continue
        }
    }

    // ========================================================================
    // QUALITY
    // ========================================================================

    async fn on_quality(&mut self, sample: QualitySample) -> Flow {
        let _ = self.events.send(CallEvent::Quality {
            call_id: self.call_id.clone(),
            sample,
        });

        if *self.state_tx.borrow() != CallState::Active {
            return Flow::Continue;
        }

        if sample.level == QualityLevel::Poor {
            self.poor_streak += 1;
            if self.poor_streak >= self.config.poor_streak_limit {
                tracing::warn!(
                    "Call {} poor for {} samples, starting recovery",
                    self.call_id,
                    self.poor_streak
                );
                self.poor_streak = 0;
                return self.begin_recovery().await;
            }
        } else {
            self.poor_streak = 0;
        }
        Flow::Continue
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    async fn begin_recovery(&mut self) -> Flow {
        self.disconnect_deadline = None;
        self.set_state(CallState::Recovering);
        self.recovery_deadline = Some(Instant::now() + self.config.recovery_ceiling);
        self.start_ice_restart().await
    }

    async fn start_ice_restart(&mut self) -> Flow {
        match self.negotiator.renegotiate_ice_restart().await {
            Ok(Some(offer)) => {
                if self.publish(SignalPayload::Offer(offer)).await.is_err() {
                    self.fail(FailureReason::Transport).await;
                    return Flow::Ended;
                }
                Flow::Continue
            }
            Ok(None) => Flow::Continue,
            Err(e) => {
                tracing::error!("ICE restart for {} failed: {}", self.call_id, e);
                self.fail(FailureReason::Negotiation).await;
                Flow::Ended
            }
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn on_command(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::ToggleMute(reply) => {
                let enabled = self.media.toggle_audio();
                tracing::debug!("Call {} audio enabled: {}", self.call_id, enabled);
                let _ = reply.send(enabled);
                Flow::Continue
            }

            SessionCommand::ToggleVideo(reply) => {
                let enabled = self.media.toggle_video();
                if let Some(enabled) = enabled {
                    tracing::debug!("Call {} video enabled: {}", self.call_id, enabled);
                }
                let _ = reply.send(enabled);
                Flow::Continue
            }

            SessionCommand::SwitchCamera(reply) => {
                let _ = reply.send(self.switch_camera().await);
                Flow::Continue
            }

            SessionCommand::End(reply) => {
                self.finish(EndReason::LocalHangup, true).await;
                let _ = reply.send(());
                Flow::Ended
            }
        }
    }

    /// Kamera-Wechsel: neuer Track zuerst, alter bleibt bis zum Erfolg
    /// unangetastet — der Anruf läuft bei jedem Fehler unverändert weiter
    async fn switch_camera(&mut self) -> Result<CameraFacing, CameraSwitchError> {
        if self.media.video.is_none() {
            return Err(CameraSwitchError::NoVideoTrack);
        }

        let target = self.media.facing.flipped();
        let new_track = self.media_source.acquire_video(target).await?;

        if let Err(e) = self.negotiator.replace_video_track(new_track.clone()).await {
            new_track.stop();
            return Err(e.into());
        }

        if let Some(old) = self.media.video.replace(new_track) {
            old.stop();
        }
        self.media.facing = target;
        tracing::info!("Call {} switched camera to {:?}", self.call_id, target);
        Ok(target)
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Reguläres Ende; `publish_hangup` nur beim lokalen `end()`
    async fn finish(&mut self, reason: EndReason, publish_hangup: bool) {
        if self.state_tx.borrow().is_terminal() {
            return;
        }

        if publish_hangup && !self.hangup_sent {
            self.hangup_sent = true;
            if let Err(e) = self.publish(SignalPayload::Hangup).await {
                tracing::warn!("Publishing hangup for {} failed: {}", self.call_id, e);
            }
        }

        self.teardown().await;
        self.set_state(CallState::Ended { reason });
    }

    /// Fataler Abbruch; Grund landet im terminalen Zustand
    async fn fail(&mut self, reason: FailureReason) {
        if self.state_tx.borrow().is_terminal() {
            return;
        }

        self.teardown().await;
        self.set_state(CallState::Failed { reason });
    }

    /// Gibt alle Ressourcen frei — auch wenn die Negotiation nie
    /// abgeschlossen wurde
    async fn teardown(&mut self) {
        self.monitor.stop();
        self.disconnect_deadline = None;
        self.recovery_deadline = None;
        self.media.stop_all();
        self.negotiator.link().close().await;

        if let Err(e) = self.store.mark_ended(&self.call_id, Utc::now()).await {
            tracing::warn!("Marking call {} ended failed: {}", self.call_id, e);
        }
        // Subscription wird mit dem Actor gedroppt und damit geschlossen
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    pub(crate) fn start_monitor(&mut self) {
        self.monitor.start(
            Arc::clone(self.negotiator.link()),
            self.config.quality_interval,
            self.quality_tx.clone(),
        );
    }

    async fn publish(&self, signal: SignalPayload) -> Result<(), crate::signaling::TransportError> {
        self.adapter
            .publish(SignalingMessage::new(
                self.call_id.clone(),
                self.adapter.self_user(),
                signal,
            ))
            .await
    }

    fn set_state(&self, state: CallState) {
        tracing::info!("Call {} -> {}", self.call_id, state);
        self.state_tx.send_replace(state.clone());
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: self.call_id.clone(),
            state,
        });
    }
}
