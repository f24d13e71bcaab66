//! Transport Module — die Peer-Verbindung hinter einem Trait
//!
//! `PeerLink` ist die Naht zwischen State Machine/Negotiator und der
//! tatsächlichen Peer-Verbindung. Die Produktiv-Implementierung sitzt
//! auf der webrtc-Crate; Tests hängen einen Mock ein.

mod webrtc_link;

pub use webrtc_link::{WebRtcLink, WebRtcLinkFactory};

use crate::media::{LocalMedia, LocalTrack};
use crate::signaling::{CandidateSdp, SessionSdp};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("No remote description set")]
    NoRemoteDescription,

    #[error("Peer connection error: {0}")]
    Peer(String),
}

#[derive(Error, Debug, Clone)]
pub enum TrackReplaceError {
    #[error("No active video sender")]
    NoVideoSender,

    #[error("Replacement track has no RTP backing")]
    NotRtpBacked,

    #[error("Track replace failed: {0}")]
    Replace(String),
}

/// Statistik-Lesen ist fehlbar, aber nie fatal — der Monitor loggt und
/// überspringt den Tick
#[derive(Error, Debug, Clone)]
#[error("Transport statistics unavailable: {0}")]
pub struct StatsError(pub String);

// ============================================================================
// LINK STATE & EVENTS
// ============================================================================

/// Verbindungszustand der Peer-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchrone Ereignisse aus der Peer-Verbindung
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(LinkState),
    /// Lokal gesammelter ICE Candidate, muss publiziert werden
    LocalCandidate(CandidateSdp),
}

// ============================================================================
// RAW STATS
// ============================================================================

/// Kumulative Transport-Zähler eines Abtast-Zeitpunkts
///
/// Raten (Bitrate, Loss-Prozent) leitet der Quality Monitor aus den
/// Deltas zweier aufeinanderfolgender Messungen ab.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawTransportStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    /// Paketverlust laut Receiver-Reports der Gegenseite
    pub packets_lost: u64,
    pub round_trip_ms: f64,
    pub jitter_ms: f64,
}

// ============================================================================
// PEER LINK
// ============================================================================

/// Eine Peer-Verbindung aus Sicht der Engine
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Hängt die lokalen Tracks an die Verbindung
    async fn attach_tracks(&self, media: &LocalMedia) -> Result<(), NegotiationError>;

    /// Erzeugt ein Offer und setzt es als Local Description
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionSdp, NegotiationError>;

    async fn set_remote_offer(&self, offer: &SessionSdp) -> Result<(), NegotiationError>;

    /// Erzeugt ein Answer zum gesetzten Remote Offer
    async fn create_answer(&self) -> Result<SessionSdp, NegotiationError>;

    async fn set_remote_answer(&self, answer: &SessionSdp) -> Result<(), NegotiationError>;

    async fn add_candidate(&self, candidate: &CandidateSdp) -> Result<(), NegotiationError>;

    /// Tauscht den ausgehenden Video-Track ohne Renegotiation
    async fn replace_video_track(
        &self,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), TrackReplaceError>;

    async fn stats(&self) -> Result<RawTransportStats, StatsError>;

    async fn close(&self);
}

/// Erzeugt Peer-Verbindungen; Events landen im übergebenen Kanal
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: Vec<RTCIceServer>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}
