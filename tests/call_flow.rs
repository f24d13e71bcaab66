//! Integrationstests über den kompletten Anruf-Lebenszyklus
//!
//! Zwei Engines teilen sich ein `MemoryRelay`; Peer-Verbindung und
//! Medien sind gemockt, die Uhr ist angehalten (`start_paused`), damit
//! Karenzzeit, Recovery-Obergrenze und Quality-Intervall deterministisch
//! ablaufen.

use async_trait::async_trait;
use call_engine::call::{CallEngine, CallError, CallEvent, CallState, EndReason, FailureReason};
use call_engine::config::{EngineConfig, StaticIceServers};
use call_engine::media::{
    CameraFacing, LocalMedia, LocalTrack, MediaAccessError, MediaKind, MediaSource, TrackKind,
};
use call_engine::signaling::{
    CallId, CandidateSdp, MemoryRelay, SessionSdp, SignalPayload, SignalingRelay,
};
use call_engine::store::{CallRecordStatus, CallStore, MemoryCallStore};
use call_engine::transport::{
    LinkState, NegotiationError, PeerLink, PeerLinkFactory, RawTransportStats, StatsError,
    TrackReplaceError, TransportEvent,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{advance, timeout};

// ============================================================================
// FAKE MEDIA
// ============================================================================

struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl LocalTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct FakeMedia;

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(
        &self,
        kind: MediaKind,
        facing: CameraFacing,
    ) -> Result<LocalMedia, MediaAccessError> {
        Ok(LocalMedia {
            audio: FakeTrack::new("fake-audio", TrackKind::Audio),
            video: kind
                .has_video()
                .then(|| FakeTrack::new("fake-video", TrackKind::Video) as Arc<dyn LocalTrack>),
            facing,
        })
    }

    async fn acquire_video(
        &self,
        _facing: CameraFacing,
    ) -> Result<Arc<dyn LocalTrack>, MediaAccessError> {
        Ok(FakeTrack::new("fake-video-2", TrackKind::Video))
    }
}

/// Medienquelle ohne Geräte; jede Beschaffung schlägt fehl
struct NoDeviceMedia;

#[async_trait]
impl MediaSource for NoDeviceMedia {
    async fn acquire(
        &self,
        _kind: MediaKind,
        _facing: CameraFacing,
    ) -> Result<LocalMedia, MediaAccessError> {
        Err(MediaAccessError::NoDevice(TrackKind::Audio))
    }

    async fn acquire_video(
        &self,
        _facing: CameraFacing,
    ) -> Result<Arc<dyn LocalTrack>, MediaAccessError> {
        Err(MediaAccessError::NoDevice(TrackKind::Video))
    }
}

// ============================================================================
// FAKE PEER LINK
// ============================================================================

struct FakeLink {
    events: mpsc::Sender<TransportEvent>,
    stats: Mutex<RawTransportStats>,
    offers: AtomicUsize,
    restarts: AtomicUsize,
    closed: AtomicBool,
}

impl FakeLink {
    async fn go(&self, state: LinkState) {
        self.events
            .send(TransportEvent::StateChanged(state))
            .await
            .unwrap();
    }

    fn set_stats(&self, stats: RawTransportStats) {
        *self.stats.lock() = stats;
    }

    fn offer_count(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn attach_tracks(&self, _media: &LocalMedia) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionSdp, NegotiationError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionSdp::new(format!("offer-{n}")))
    }

    async fn set_remote_offer(&self, _offer: &SessionSdp) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionSdp, NegotiationError> {
        Ok(SessionSdp::new("answer"))
    }

    async fn set_remote_answer(&self, _answer: &SessionSdp) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn add_candidate(&self, _candidate: &CandidateSdp) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn replace_video_track(
        &self,
        _track: Arc<dyn LocalTrack>,
    ) -> Result<(), TrackReplaceError> {
        Ok(())
    }

    async fn stats(&self) -> Result<RawTransportStats, StatsError> {
        Ok(*self.stats.lock())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeLinkFactory {
    created: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeLinkFactory {
    fn link(&self) -> Arc<FakeLink> {
        self.created.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl PeerLinkFactory for FakeLinkFactory {
    async fn create(
        &self,
        _ice_servers: Vec<webrtc::ice_transport::ice_server::RTCIceServer>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let link = Arc::new(FakeLink {
            events,
            stats: Mutex::new(RawTransportStats::default()),
            offers: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.created.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

// ============================================================================
// HARNESS
// ============================================================================

struct Peer {
    engine: CallEngine,
    links: Arc<FakeLinkFactory>,
    store: Arc<MemoryCallStore>,
    events: broadcast::Receiver<CallEvent>,
}

fn peer(name: &str, relay: &Arc<MemoryRelay>) -> Peer {
    let links = Arc::new(FakeLinkFactory::default());
    let store = Arc::new(MemoryCallStore::new());
    let relay: Arc<dyn SignalingRelay> = Arc::clone(relay) as Arc<dyn SignalingRelay>;

    let engine = CallEngine::new(
        name,
        relay,
        Arc::clone(&store) as Arc<dyn CallStore>,
        Arc::new(FakeMedia),
        Arc::clone(&links) as Arc<dyn PeerLinkFactory>,
        Arc::new(StaticIceServers::default()),
        EngineConfig::default(),
    );
    let events = engine.subscribe();

    Peer {
        engine,
        links,
        store,
        events,
    }
}

async fn wait_for_state(peer: &mut Peer, want: CallState) {
    let waited = timeout(Duration::from_secs(120), async {
        loop {
            match peer.events.recv().await {
                Ok(CallEvent::StateChanged { state, .. }) if state == want => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed before reaching {want}")
                }
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for state {want}");
}

/// Baut einen Anruf bis `active` auf beiden Seiten auf
async fn establish(
    alice: &mut Peer,
    bob: &mut Peer,
    call_id: &CallId,
) -> (Arc<FakeLink>, Arc<FakeLink>) {
    bob.engine
        .join(call_id.clone(), MediaKind::AudioVideo)
        .await
        .unwrap();
    alice
        .engine
        .start(call_id.clone(), MediaKind::AudioVideo)
        .await
        .unwrap();

    wait_for_state(bob, CallState::Negotiating).await;

    let alice_link = alice.links.link();
    let bob_link = bob.links.link();
    alice_link.go(LinkState::Connected).await;
    bob_link.go(LinkState::Connected).await;

    wait_for_state(alice, CallState::Active).await;
    wait_for_state(bob, CallState::Active).await;

    (alice_link, bob_link)
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn handshake_reaches_active_on_both_sides() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-1");

    establish(&mut alice, &mut bob, &call_id).await;

    assert_eq!(alice.engine.state(&call_id).await, Some(CallState::Active));
    assert_eq!(bob.engine.state(&call_id).await, Some(CallState::Active));

    // Callee schreibt das Answer-Payload in seinen Store
    let record = bob.store.get(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallRecordStatus::Active);
    assert!(record.answer_sdp.is_some());
}

#[tokio::test(start_paused = true)]
async fn local_end_publishes_exactly_one_hangup() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-2");

    establish(&mut alice, &mut bob, &call_id).await;

    // Roh-Abgriff aller Nachrichten des Anrufs
    let mut tap = relay.subscribe(&call_id).await.unwrap();

    alice.engine.end(&call_id).await.unwrap();
    alice.engine.end(&call_id).await.unwrap();

    wait_for_state(
        &mut alice,
        CallState::Ended {
            reason: EndReason::LocalHangup,
        },
    )
    .await;
    wait_for_state(
        &mut bob,
        CallState::Ended {
            reason: EndReason::RemoteHangup,
        },
    )
    .await;

    let mut hangups = 0;
    while let Ok(msg) = tap.try_recv() {
        if msg.from_user == "alice" && matches!(msg.signal, SignalPayload::Hangup) {
            hangups += 1;
        }
    }
    assert_eq!(hangups, 1);

    // Beide Stores haben den Anruf abgeschlossen
    let record = alice.store.get(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallRecordStatus::Ended);
    assert!(record.duration_secs.is_some());
}

#[tokio::test(start_paused = true)]
async fn short_disconnect_blip_does_not_trigger_recovery() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-3");

    let (alice_link, _) = establish(&mut alice, &mut bob, &call_id).await;

    alice_link.go(LinkState::Disconnected).await;
    advance(Duration::from_secs(1)).await;
    alice_link.go(LinkState::Connected).await;
    advance(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;

    assert_eq!(alice.engine.state(&call_id).await, Some(CallState::Active));
    assert_eq!(alice_link.restart_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn sustained_disconnect_triggers_single_ice_restart() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-4");

    let (alice_link, _) = establish(&mut alice, &mut bob, &call_id).await;

    alice_link.go(LinkState::Disconnected).await;
    wait_for_state(&mut alice, CallState::Recovering).await;
    assert_eq!(alice_link.restart_count(), 1);

    // Gegenseite beantwortet das Restart-Offer, Verbindung kommt zurück
    alice_link.go(LinkState::Connected).await;
    wait_for_state(&mut alice, CallState::Active).await;
    assert_eq!(alice_link.restart_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn sustained_poor_quality_triggers_recovery() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-5");

    let (alice_link, _) = establish(&mut alice, &mut bob, &call_id).await;

    // Jedes Sample ab jetzt: 400 ms RTT, also poor
    alice_link.set_stats(RawTransportStats {
        round_trip_ms: 400.0,
        ..Default::default()
    });

    wait_for_state(&mut alice, CallState::Recovering).await;
    assert_eq!(alice_link.restart_count(), 1);

    // Nach dem Restart erholt sich der Link
    alice_link.set_stats(RawTransportStats {
        round_trip_ms: 20.0,
        ..Default::default()
    });
    alice_link.go(LinkState::Connected).await;
    wait_for_state(&mut alice, CallState::Active).await;
}

#[tokio::test(start_paused = true)]
async fn recovery_past_ceiling_fails_the_call() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-6");

    let (alice_link, _) = establish(&mut alice, &mut bob, &call_id).await;

    alice_link.go(LinkState::Disconnected).await;
    wait_for_state(&mut alice, CallState::Recovering).await;

    // Verbindung kommt nie zurück
    wait_for_state(
        &mut alice,
        CallState::Failed {
            reason: FailureReason::RecoveryTimeout,
        },
    )
    .await;
    assert!(alice_link.is_closed());
}

#[tokio::test(start_paused = true)]
async fn second_start_is_refused_while_in_call() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-7");

    establish(&mut alice, &mut bob, &call_id).await;

    let second = alice
        .engine
        .start(CallId::new("call-8"), MediaKind::AudioOnly)
        .await;
    assert!(matches!(second, Err(CallError::AlreadyInCall)));

    // Nach dem Ende ist der Slot wieder frei
    alice.engine.end(&call_id).await.unwrap();
    wait_for_state(
        &mut alice,
        CallState::Ended {
            reason: EndReason::LocalHangup,
        },
    )
    .await;

    alice
        .engine
        .start(CallId::new("call-9"), MediaKind::AudioOnly)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn remote_store_end_terminates_without_hangup() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-10");

    establish(&mut alice, &mut bob, &call_id).await;

    let mut tap = relay.subscribe(&call_id).await.unwrap();
    bob.store.end_remotely(&call_id);

    wait_for_state(
        &mut bob,
        CallState::Ended {
            reason: EndReason::RemoteEnded,
        },
    )
    .await;

    // Store-Ende publiziert kein eigenes Hangup
    while let Ok(msg) = tap.try_recv() {
        assert!(!matches!(msg.signal, SignalPayload::Hangup));
    }
}

#[tokio::test(start_paused = true)]
async fn in_call_controls_toggle_and_switch() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = peer("alice", &relay);
    let mut bob = peer("bob", &relay);
    let call_id = CallId::new("call-11");

    let (alice_link, _) = establish(&mut alice, &mut bob, &call_id).await;
    let offers_before = alice_link.offer_count();

    // Tracks starten enabled; erster Toggle schaltet aus
    assert!(!alice.engine.toggle_mute(&call_id).await.unwrap());
    assert!(alice.engine.toggle_mute(&call_id).await.unwrap());

    assert!(!alice.engine.toggle_video(&call_id).await.unwrap());

    let facing = alice.engine.switch_camera(&call_id).await.unwrap();
    assert_eq!(facing, CameraFacing::Back);
    let facing = alice.engine.switch_camera(&call_id).await.unwrap();
    assert_eq!(facing, CameraFacing::Front);

    // Weder Toggles noch Kamera-Wechsel lösen eine Renegotiation aus
    assert_eq!(alice_link.offer_count(), offers_before);
}

#[tokio::test(start_paused = true)]
async fn audio_only_call_has_no_video_controls() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = peer("alice", &relay);
    let call_id = CallId::new("call-12");

    alice
        .engine
        .start(call_id.clone(), MediaKind::AudioOnly)
        .await
        .unwrap();

    let toggled = alice.engine.toggle_video(&call_id).await;
    assert!(matches!(toggled, Err(CallError::NoVideoTrack)));

    let switched = alice.engine.switch_camera(&call_id).await;
    assert!(matches!(
        switched,
        Err(CallError::CameraSwitch(_)) | Err(CallError::NoVideoTrack)
    ));
}

#[tokio::test(start_paused = true)]
async fn media_failure_surfaces_and_leaves_no_session() {
    let links = Arc::new(FakeLinkFactory::default());
    let store = Arc::new(MemoryCallStore::new());

    let engine = CallEngine::new(
        "alice",
        Arc::new(MemoryRelay::new()) as Arc<dyn SignalingRelay>,
        Arc::clone(&store) as Arc<dyn CallStore>,
        Arc::new(NoDeviceMedia),
        Arc::clone(&links) as Arc<dyn PeerLinkFactory>,
        Arc::new(StaticIceServers::default()),
        EngineConfig::default(),
    );

    let call_id = CallId::new("call-13");
    let started = engine.start(call_id.clone(), MediaKind::AudioOnly).await;
    assert!(matches!(started, Err(CallError::Media(_))));

    // Slot ist wieder frei, kein hängengebliebener Anruf
    assert!(engine.state(&call_id).await.is_none());

    // Die schon erzeugte Peer-Verbindung wurde geschlossen, nicht geleakt
    assert!(links.link().is_closed());
}

#[tokio::test(start_paused = true)]
async fn commands_for_unknown_calls_are_rejected() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = peer("alice", &relay);
    let call_id = CallId::new("call-14");

    let toggled = alice.engine.toggle_mute(&call_id).await;
    assert!(matches!(toggled, Err(CallError::NoActiveCall(_))));

    // end() auf unbekannte Anrufe ist ein no-op
    alice.engine.end(&call_id).await.unwrap();
}
