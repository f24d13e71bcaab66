//! Candidate Queue
//!
//! Puffert ICE Candidates, die vor der Remote Description eintreffen.
//! Sobald die Remote Description steht, werden alle gepufferten
//! Candidates in Ankunftsreihenfolge angewendet — nie still verworfen.

use crate::signaling::CandidateSdp;

/// Puffer für verfrüht eingetroffene ICE Candidates
///
/// Lebensdauer ist an einen einzelnen Negotiation-Versuch gebunden:
/// bei Abschluss geleert per `drain_if_ready`, bei Neustart per `clear`.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    queued: Vec<CandidateSdp>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) Append
    pub fn enqueue(&mut self, candidate: CandidateSdp) {
        self.queued.push(candidate);
    }

    /// Gibt alle gepufferten Candidates in Ankunftsreihenfolge zurück
    /// und leert die Queue — aber nur, wenn die Remote Description steht
    pub fn drain_if_ready(&mut self, has_remote_description: bool) -> Vec<CandidateSdp> {
        if has_remote_description {
            std::mem::take(&mut self.queued)
        } else {
            Vec::new()
        }
    }

    /// Verwirft alle gepufferten Candidates (Negotiation-Neustart)
    pub fn clear(&mut self) {
        self.queued.clear();
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> CandidateSdp {
        CandidateSdp::new(format!("candidate:{n}"))
    }

    #[test]
    fn drains_in_arrival_order_once_ready() {
        let mut queue = CandidateQueue::new();
        queue.enqueue(candidate(1));
        queue.enqueue(candidate(2));
        queue.enqueue(candidate(3));

        // Ohne Remote Description bleibt alles liegen
        assert!(queue.drain_if_ready(false).is_empty());
        assert_eq!(queue.len(), 3);

        let drained = queue.drain_if_ready(true);
        assert_eq!(
            drained,
            vec![candidate(1), candidate(2), candidate(3)]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_after_drain_is_empty() {
        let mut queue = CandidateQueue::new();
        queue.enqueue(candidate(1));

        assert_eq!(queue.drain_if_ready(true).len(), 1);
        assert!(queue.drain_if_ready(true).is_empty());
    }

    #[test]
    fn clear_discards_everything() {
        let mut queue = CandidateQueue::new();
        queue.enqueue(candidate(1));
        queue.enqueue(candidate(2));

        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.drain_if_ready(true).is_empty());
    }
}
