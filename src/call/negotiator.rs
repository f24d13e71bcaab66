//! Session Negotiator
//!
//! Besitzt den Offer/Answer-Austausch einer Session: hängt Tracks an,
//! erzeugt und akzeptiert Descriptions, puffert verfrühte Candidates
//! und fährt Renegotiations (ICE-Restart) — immer nur eine zur Zeit,
//! weitere Anfragen werden koalesziert.

use super::candidates::CandidateQueue;
use crate::media::{LocalMedia, LocalTrack};
use crate::signaling::{CandidateSdp, SessionSdp};
use crate::transport::{NegotiationError, PeerLink, TrackReplaceError};
use std::sync::Arc;

// ============================================================================
// NEGOTIATION STATE
// ============================================================================

/// Stand des Offer/Answer-Austauschs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Noch kein Austausch gestartet
    Idle,
    /// Lokales Offer steht, Answer der Gegenseite ausstehend
    AwaitingAnswer,
    /// Austausch abgeschlossen
    Stable,
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

pub struct Negotiator {
    link: Arc<dyn PeerLink>,
    queue: CandidateQueue,
    state: NegotiationState,
    has_remote: bool,
    restart_in_flight: bool,
    restart_queued: bool,
}

impl Negotiator {
    pub fn new(link: Arc<dyn PeerLink>) -> Self {
        Self {
            link,
            queue: CandidateQueue::new(),
            state: NegotiationState::Idle,
            has_remote: false,
            restart_in_flight: false,
            restart_queued: false,
        }
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Caller-Seite: Tracks anhängen, Offer erzeugen und als Local
    /// Description hinterlegen
    pub async fn create_offer(&mut self, media: &LocalMedia) -> Result<SessionSdp, NegotiationError> {
        self.link.attach_tracks(media).await?;
        let offer = self.link.create_offer(false).await?;
        self.state = NegotiationState::AwaitingAnswer;
        Ok(offer)
    }

    /// Callee-Seite: Remote Offer setzen, Tracks anhängen, Answer
    /// erzeugen; gepufferte Candidates werden sofort angewendet
    pub async fn accept_offer(
        &mut self,
        remote: &SessionSdp,
        media: &LocalMedia,
    ) -> Result<SessionSdp, NegotiationError> {
        self.link.set_remote_offer(remote).await?;
        self.has_remote = true;
        self.link.attach_tracks(media).await?;
        let answer = self.link.create_answer().await?;
        self.state = NegotiationState::Stable;
        self.flush_queue().await;
        Ok(answer)
    }

    /// Restart-Offer der Gegenseite auf bestehender Session: Tracks
    /// bleiben angehängt, nur Description-Austausch
    pub async fn accept_restart_offer(
        &mut self,
        remote: &SessionSdp,
    ) -> Result<SessionSdp, NegotiationError> {
        self.queue.clear();
        self.link.set_remote_offer(remote).await?;
        self.has_remote = true;
        let answer = self.link.create_answer().await?;
        self.state = NegotiationState::Stable;
        Ok(answer)
    }

    /// Answer zum ausstehenden Offer; Duplikate sind no-ops
    pub async fn accept_answer(&mut self, remote: &SessionSdp) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::AwaitingAnswer {
            tracing::debug!("Ignoring answer without pending offer (duplicate?)");
            return Ok(());
        }

        self.link.set_remote_answer(remote).await?;
        self.has_remote = true;
        self.state = NegotiationState::Stable;
        self.restart_in_flight = false;
        self.flush_queue().await;
        Ok(())
    }

    /// Wendet einen Candidate an oder puffert ihn, solange die Remote
    /// Description fehlt. Anwendungsfehler einzelner Candidates sind
    /// nicht fatal.
    pub async fn apply_candidate(&mut self, candidate: CandidateSdp) {
        if self.has_remote {
            if let Err(e) = self.link.add_candidate(&candidate).await {
                tracing::warn!("Failed to apply ICE candidate: {}", e);
            }
        } else {
            tracing::debug!("Queueing ICE candidate before remote description");
            self.queue.enqueue(candidate);
        }
    }

    /// Startet eine Recovery-Renegotiation (ICE-Restart)
    ///
    /// Läuft bereits eine, wird die Anfrage koalesziert und `None`
    /// zurückgegeben; nach Abschluss der laufenden liefert
    /// [`Negotiator::take_queued_restart`] genau eine Nachholung.
    pub async fn renegotiate_ice_restart(
        &mut self,
    ) -> Result<Option<SessionSdp>, NegotiationError> {
        if self.restart_in_flight {
            tracing::debug!("ICE restart already in flight, coalescing request");
            self.restart_queued = true;
            return Ok(None);
        }

        // Candidates gehören zum alten Versuch
        self.queue.clear();

        let offer = self.link.create_offer(true).await?;
        self.restart_in_flight = true;
        self.state = NegotiationState::AwaitingAnswer;
        Ok(Some(offer))
    }

    /// Holt eine während des letzten Restarts koaleszierte Anfrage ab
    pub fn take_queued_restart(&mut self) -> bool {
        std::mem::take(&mut self.restart_queued)
    }

    /// Tauscht den ausgehenden Video-Track ohne Renegotiation
    pub async fn replace_video_track(
        &self,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), TrackReplaceError> {
        self.link.replace_video_track(track).await
    }

    pub fn pending_candidates(&self) -> usize {
        self.queue.len()
    }

    async fn flush_queue(&mut self) {
        for candidate in self.queue.drain_if_ready(self.has_remote) {
            if let Err(e) = self.link.add_candidate(&candidate).await {
                tracing::warn!("Failed to apply queued ICE candidate: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("state", &self.state)
            .field("has_remote", &self.has_remote)
            .field("pending_candidates", &self.queue.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CameraFacing, MediaKind, MediaSource, RtpMediaSource};
    use crate::transport::{RawTransportStats, StatsError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Mock-Link, der nur Aufrufe protokolliert
    #[derive(Default)]
    struct RecordingLink {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingLink {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn attach_tracks(&self, _media: &LocalMedia) -> Result<(), NegotiationError> {
            self.record("attach_tracks");
            Ok(())
        }

        async fn create_offer(&self, ice_restart: bool) -> Result<SessionSdp, NegotiationError> {
            self.record(if ice_restart { "offer(restart)" } else { "offer" });
            Ok(SessionSdp::new("offer-sdp"))
        }

        async fn set_remote_offer(&self, _offer: &SessionSdp) -> Result<(), NegotiationError> {
            self.record("set_remote_offer");
            Ok(())
        }

        async fn create_answer(&self) -> Result<SessionSdp, NegotiationError> {
            self.record("answer");
            Ok(SessionSdp::new("answer-sdp"))
        }

        async fn set_remote_answer(&self, _answer: &SessionSdp) -> Result<(), NegotiationError> {
            self.record("set_remote_answer");
            Ok(())
        }

        async fn add_candidate(&self, candidate: &CandidateSdp) -> Result<(), NegotiationError> {
            self.record(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn replace_video_track(
            &self,
            _track: Arc<dyn LocalTrack>,
        ) -> Result<(), TrackReplaceError> {
            self.record("replace_video_track");
            Ok(())
        }

        async fn stats(&self) -> Result<RawTransportStats, StatsError> {
            Ok(RawTransportStats::default())
        }

        async fn close(&self) {
            self.record("close");
        }
    }

    async fn media() -> LocalMedia {
        RtpMediaSource::new()
            .acquire(MediaKind::AudioOnly, CameraFacing::Front)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn early_candidates_are_queued_and_flushed_in_order() {
        let link = Arc::new(RecordingLink::default());
        let mut negotiator = Negotiator::new(link.clone());

        negotiator.create_offer(&media().await).await.unwrap();

        negotiator.apply_candidate(CandidateSdp::new("a")).await;
        negotiator.apply_candidate(CandidateSdp::new("b")).await;
        negotiator.apply_candidate(CandidateSdp::new("c")).await;
        assert_eq!(negotiator.pending_candidates(), 3);

        negotiator
            .accept_answer(&SessionSdp::new("answer-sdp"))
            .await
            .unwrap();

        assert_eq!(negotiator.pending_candidates(), 0);
        assert_eq!(
            link.calls(),
            vec![
                "attach_tracks",
                "offer",
                "set_remote_answer",
                "candidate:a",
                "candidate:b",
                "candidate:c",
            ]
        );
    }

    #[tokio::test]
    async fn candidates_after_remote_apply_directly() {
        let link = Arc::new(RecordingLink::default());
        let mut negotiator = Negotiator::new(link.clone());

        negotiator
            .accept_offer(&SessionSdp::new("offer-sdp"), &media().await)
            .await
            .unwrap();
        negotiator.apply_candidate(CandidateSdp::new("x")).await;

        assert_eq!(negotiator.pending_candidates(), 0);
        assert!(link.calls().contains(&"candidate:x".to_string()));
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored() {
        let link = Arc::new(RecordingLink::default());
        let mut negotiator = Negotiator::new(link.clone());

        negotiator.create_offer(&media().await).await.unwrap();
        negotiator
            .accept_answer(&SessionSdp::new("answer-sdp"))
            .await
            .unwrap();
        negotiator
            .accept_answer(&SessionSdp::new("answer-sdp"))
            .await
            .unwrap();

        let remote_answers = link
            .calls()
            .iter()
            .filter(|c| *c == "set_remote_answer")
            .count();
        assert_eq!(remote_answers, 1);
    }

    #[tokio::test]
    async fn second_restart_is_coalesced() {
        let link = Arc::new(RecordingLink::default());
        let mut negotiator = Negotiator::new(link.clone());

        negotiator.create_offer(&media().await).await.unwrap();
        negotiator
            .accept_answer(&SessionSdp::new("answer-sdp"))
            .await
            .unwrap();

        let first = negotiator.renegotiate_ice_restart().await.unwrap();
        assert!(first.is_some());

        // Zweite Anfrage während der laufenden: kein weiteres Offer,
        // aber genau eine vorgemerkte Nachholung
        let second = negotiator.renegotiate_ice_restart().await.unwrap();
        assert!(second.is_none());

        negotiator
            .accept_answer(&SessionSdp::new("answer-sdp"))
            .await
            .unwrap();
        assert!(negotiator.take_queued_restart());
        assert!(!negotiator.take_queued_restart());

        let restarts = link
            .calls()
            .iter()
            .filter(|c| *c == "offer(restart)")
            .count();
        assert_eq!(restarts, 1);
    }

    #[tokio::test]
    async fn restart_clears_stale_candidates() {
        let link = Arc::new(RecordingLink::default());
        let mut negotiator = Negotiator::new(link.clone());

        negotiator.create_offer(&media().await).await.unwrap();
        negotiator.apply_candidate(CandidateSdp::new("stale")).await;
        assert_eq!(negotiator.pending_candidates(), 1);

        let offer = negotiator.renegotiate_ice_restart().await.unwrap();
        assert!(offer.is_some());
        assert_eq!(negotiator.pending_candidates(), 0);
        assert!(!link.calls().contains(&"candidate:stale".to_string()));
    }
}
