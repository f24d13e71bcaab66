//! RTP-basierte Tracks über die webrtc-Crate
//!
//! `RtpTrack` kapselt einen `TrackLocalStaticRTP` plus Enabled-Flag;
//! die Samples schreibt der Embedder selbst auf den RTP-Track.

use super::{CameraFacing, LocalMedia, LocalTrack, MediaAccessError, MediaKind, MediaSource, TrackKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate für Opus-Audio (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// RTP Clock Rate für Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// Stream-ID aller lokalen Tracks
const STREAM_ID: &str = "call-engine";

// ============================================================================
// RTP TRACK
// ============================================================================

/// Lokaler Track auf RTP-Basis
pub struct RtpTrack {
    track: Arc<TrackLocalStaticRTP>,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RtpTrack {
    /// Opus-Audio-Track (48kHz, Mono)
    pub fn audio() -> Self {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ));
        Self {
            track,
            kind: TrackKind::Audio,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// VP8-Video-Track
    pub fn video() -> Self {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
            "video".to_string(),
            STREAM_ID.to_string(),
        ));
        Self {
            track,
            kind: TrackKind::Video,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Zugriff für Embedder, die Samples schreiben wollen
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.track)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for RtpTrack {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!("{} track enabled: {}", self.kind, enabled);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        tracing::debug!("{} track stopped", self.kind);
    }

    fn rtp(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>)
    }
}

impl std::fmt::Debug for RtpTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpTrack")
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
// RTP MEDIA SOURCE
// ============================================================================

/// MediaSource, die statische RTP-Tracks produziert
///
/// Geräte-Capture ist Sache des Embedders; diese Quelle liefert nur die
/// RTP-Senken, auf die er seine Samples schreibt.
#[derive(Debug, Default)]
pub struct RtpMediaSource;

impl RtpMediaSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for RtpMediaSource {
    async fn acquire(
        &self,
        kind: MediaKind,
        facing: CameraFacing,
    ) -> Result<LocalMedia, MediaAccessError> {
        let audio: Arc<dyn LocalTrack> = Arc::new(RtpTrack::audio());
        let video: Option<Arc<dyn LocalTrack>> = if kind.has_video() {
            Some(Arc::new(RtpTrack::video()))
        } else {
            None
        };

        tracing::info!("Acquired local media: {:?}, facing {:?}", kind, facing);

        Ok(LocalMedia {
            audio,
            video,
            facing,
        })
    }

    async fn acquire_video(
        &self,
        facing: CameraFacing,
    ) -> Result<Arc<dyn LocalTrack>, MediaAccessError> {
        tracing::info!("Acquired video track, facing {:?}", facing);
        Ok(Arc::new(RtpTrack::video()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn audio_only_has_no_video_track() {
        let source = RtpMediaSource::new();
        let media = source
            .acquire(MediaKind::AudioOnly, CameraFacing::Front)
            .await
            .unwrap();

        assert!(media.video.is_none());
        assert_eq!(media.kind(), MediaKind::AudioOnly);
    }

    #[tokio::test]
    async fn toggle_twice_restores_enabled_flag() {
        let source = RtpMediaSource::new();
        let media = source
            .acquire(MediaKind::AudioVideo, CameraFacing::Front)
            .await
            .unwrap();

        assert!(media.audio.is_enabled());
        assert!(!media.toggle_audio());
        assert!(media.toggle_audio());
        assert!(media.audio.is_enabled());

        assert_eq!(media.toggle_video(), Some(false));
        assert_eq!(media.toggle_video(), Some(true));
    }

    #[tokio::test]
    async fn stop_disables_the_track() {
        let track = RtpTrack::audio();
        assert!(track.is_enabled());
        track.stop();
        assert!(track.is_stopped());
        assert!(!track.is_enabled());
    }
}
