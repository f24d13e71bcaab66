//! # call-engine
//!
//! Peer-to-Peer Call Session Engine: verwaltet den kompletten
//! Lebenszyklus eines Anrufs — Signaling, SDP-Verhandlung mit
//! Trickle-ICE, Qualitätsüberwachung und automatische Recovery über
//! ICE-Restarts.
//!
//! Pro Anruf läuft genau ein Session-Task; alle Ereignisse (Signale,
//! Transport-Zustände, Quality-Samples, Kommandos) werden dort
//! sequenziell verarbeitet. Die Seams nach außen sind Traits:
//! [`SignalingRelay`] für den Nachrichtentransport, [`MediaSource`] für
//! lokale Tracks, [`PeerLinkFactory`] für die Peer-Verbindung und
//! [`CallStore`] für die Anruf-Historie — Produktiv-Implementierungen
//! (WebSocket, WebRTC, RTP) liegen bei, Tests stecken eigene ein.

pub mod call;
pub mod config;
pub mod media;
pub mod signaling;
pub mod store;
pub mod transport;

pub use call::{
    CallEngine, CallError, CallEvent, CallState, EndReason, FailureReason, QualityLevel,
    QualitySample,
};
pub use config::{EngineConfig, IceServerProvider, StaticIceServers};
pub use media::{CameraFacing, MediaKind, MediaSource};
pub use signaling::{CallId, SignalingRelay};
pub use store::CallStore;
pub use transport::{PeerLink, PeerLinkFactory};

/// Initialisiert strukturiertes Logging; `RUST_LOG` übersteuert die
/// Default-Direktiven
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,call_engine=debug,webrtc=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
