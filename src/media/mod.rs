//! Media Module — lokale Tracks und deren Beschaffung
//!
//! Geräte-Capture und Rendering liegen außerhalb der Engine; hier leben
//! nur die Track-Handles, deren Enabled-Flags (Mute/Video-Off) und das
//! `MediaSource` Interface, über das der Embedder Tracks liefert.

mod rtp;

pub use rtp::{RtpMediaSource, RtpTrack, SAMPLE_RATE, VIDEO_CLOCK_RATE};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaAccessError {
    #[error("No {0} capture device available")]
    NoDevice(TrackKind),

    #[error("Access to {0} capture denied")]
    Denied(TrackKind),

    #[error("Media acquisition failed: {0}")]
    Acquisition(String),
}

// ============================================================================
// KINDS
// ============================================================================

/// Medienart eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    AudioOnly,
    AudioVideo,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, MediaKind::AudioVideo)
    }
}

/// Art eines einzelnen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Ausrichtung der aktiven Kamera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Back,
}

impl CameraFacing {
    pub fn flipped(&self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        }
    }
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

/// Handle auf einen lokalen Media-Track
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    /// Schaltet den Track stumm bzw. wieder aktiv — rein lokal,
    /// keine Renegotiation
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Gibt das Gerät frei; der Track liefert danach keine Samples mehr
    fn stop(&self);

    /// Darunterliegender RTP-Track, falls die Implementierung einen hat
    fn rtp(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

// ============================================================================
// LOCAL MEDIA BUNDLE
// ============================================================================

/// Die lokalen Tracks einer Session
#[derive(Clone)]
pub struct LocalMedia {
    pub audio: Arc<dyn LocalTrack>,
    pub video: Option<Arc<dyn LocalTrack>>,
    pub facing: CameraFacing,
}

impl LocalMedia {
    pub fn kind(&self) -> MediaKind {
        if self.video.is_some() {
            MediaKind::AudioVideo
        } else {
            MediaKind::AudioOnly
        }
    }

    /// Kippt das Audio-Enabled-Flag, gibt den neuen Wert zurück
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.audio.is_enabled();
        self.audio.set_enabled(enabled);
        enabled
    }

    /// Kippt das Video-Enabled-Flag; `None` bei Audio-only
    pub fn toggle_video(&self) -> Option<bool> {
        self.video.as_ref().map(|video| {
            let enabled = !video.is_enabled();
            video.set_enabled(enabled);
            enabled
        })
    }

    /// Stoppt alle Tracks (Teardown)
    pub fn stop_all(&self) {
        self.audio.stop();
        if let Some(video) = &self.video {
            video.stop();
        }
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("kind", &self.kind())
            .field("facing", &self.facing)
            .finish()
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Liefert lokale Tracks für eine Session
///
/// `acquire` darf blockieren (Geräte-Zugriff), läuft aber nie im
/// Event-Loop einer anderen Session. Schlägt die Beschaffung fehl, gibt
/// es keinen Fallback auf Ersatz-Media — der Fehler geht an den Aufrufer.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(
        &self,
        kind: MediaKind,
        facing: CameraFacing,
    ) -> Result<LocalMedia, MediaAccessError>;

    /// Beschafft nur einen Video-Track der angegebenen Kamera
    /// (Kamera-Wechsel während eines Anrufs)
    async fn acquire_video(
        &self,
        facing: CameraFacing,
    ) -> Result<Arc<dyn LocalTrack>, MediaAccessError>;
}
