//! WebRTC Peer Link
//!
//! Produktiv-Implementierung von `PeerLink` auf `RTCPeerConnection`.
//! Verbindungszustand und lokal gesammelte Candidates laufen als
//! `TransportEvent` in den Kanal, den die Factory bekommen hat.

use super::{
    LinkState, NegotiationError, PeerLink, PeerLinkFactory, RawTransportStats, StatsError,
    TrackReplaceError, TransportEvent,
};
use crate::media::{LocalMedia, LocalTrack};
use crate::signaling::{CandidateSdp, SessionSdp};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::stats::StatsReportType;

// ============================================================================
// FACTORY
// ============================================================================

/// Baut `WebRtcLink`s über die webrtc-API
#[derive(Debug, Default)]
pub struct WebRtcLinkFactory;

impl WebRtcLinkFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
        ice_servers: Vec<RTCIceServer>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        // Media Engine mit Standard-Codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| NegotiationError::Peer(e.to_string()))?,
        );

        register_handlers(&pc, events);

        Ok(Arc::new(WebRtcLink { pc }))
    }
}

/// Verdrahtet die Peer-Connection-Callbacks mit dem Event-Kanal
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::Sender<TransportEvent>) {
    // Connection State
    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let mapped = match s {
            RTCPeerConnectionState::New => Some(LinkState::New),
            RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            _ => None,
        };

        let tx = state_tx.clone();
        Box::pin(async move {
            if let Some(state) = mapped {
                let _ = tx.send(TransportEvent::StateChanged(state)).await;
            }
        })
    }));

    // ICE Candidates
    let candidate_tx = events;
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(TransportEvent::LocalCandidate(CandidateSdp {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }))
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate: {}", e);
                    }
                }
            }
        })
    }));

    // Eingehende Remote-Tracks; das Rendern übernimmt der Embedder
    pc.on_track(Box::new(move |track, _, _| {
        Box::pin(async move {
            tracing::info!("Received remote track: {:?}", track.codec());
        })
    }));
}

// ============================================================================
// LINK
// ============================================================================

/// `PeerLink` über `RTCPeerConnection`
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn attach_tracks(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        let audio = media
            .audio
            .rtp()
            .ok_or_else(|| NegotiationError::Peer("audio track has no RTP backing".to_string()))?;
        self.pc
            .add_track(audio)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        if let Some(video) = &media.video {
            let video = video.rtp().ok_or_else(|| {
                NegotiationError::Peer("video track has no RTP backing".to_string())
            })?;
            self.pc
                .add_track(video)
                .await
                .map_err(|e| NegotiationError::Peer(e.to_string()))?;
        }

        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionSdp, NegotiationError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        Ok(SessionSdp::new(offer.sdp))
    }

    async fn set_remote_offer(&self, offer: &SessionSdp) -> Result<(), NegotiationError> {
        let desc = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionSdp, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        Ok(SessionSdp::new(answer.sdp))
    }

    async fn set_remote_answer(&self, answer: &SessionSdp) -> Result<(), NegotiationError> {
        let desc = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))
    }

    async fn add_candidate(&self, candidate: &CandidateSdp) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))
    }

    async fn replace_video_track(
        &self,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), TrackReplaceError> {
        let rtp = track.rtp().ok_or(TrackReplaceError::NotRtpBacked)?;

        for sender in self.pc.get_senders().await {
            let is_video = sender
                .track()
                .await
                .map(|t| t.kind() == RTPCodecType::Video)
                .unwrap_or(false);

            if is_video {
                return sender
                    .replace_track(Some(rtp))
                    .await
                    .map_err(|e| TrackReplaceError::Replace(e.to_string()));
            }
        }

        Err(TrackReplaceError::NoVideoSender)
    }

    async fn stats(&self) -> Result<RawTransportStats, StatsError> {
        let report = self.pc.get_stats().await;
        let mut stats = RawTransportStats::default();

        // OutboundRTP liefert die eigenen Sende-Zähler, RemoteInboundRTP
        // die Receiver-Reports der Gegenseite (Loss, RTT). Das nominierte
        // Candidate Pair dient als RTT-Fallback. Jitter liefert webrtc 0.11
        // in keinem Stats-Report; `jitter_ms` bleibt auf dem Default.
        for (_id, entry) in report.reports.iter() {
            match entry {
                StatsReportType::OutboundRTP(outbound) => {
                    stats.bytes_sent += outbound.bytes_sent;
                    stats.packets_sent += outbound.packets_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packets_lost += remote.packets_lost.max(0) as u64;
                    if let Some(rtt) = remote.round_trip_time {
                        stats.round_trip_ms = rtt * 1000.0;
                    }
                }
                StatsReportType::CandidatePair(pair) => {
                    if pair.nominated && stats.round_trip_ms == 0.0 {
                        stats.round_trip_ms = pair.current_round_trip_time * 1000.0;
                    }
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Closing peer connection failed: {}", e);
        }
    }
}

impl std::fmt::Debug for WebRtcLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcLink")
            .field("state", &self.pc.connection_state())
            .finish()
    }
}
