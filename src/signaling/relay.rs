//! Signaling-Relay Abstraktion
//!
//! Das Relay ist ein append-only Nachrichtenkanal pro Call-ID:
//! `publish` schreibt eine Nachricht, `subscribe` liefert alle ab dem
//! Zeitpunkt des Abonnements eintreffenden Nachrichten. Zustellung ist
//! at-least-once; Konsumenten müssen Duplikate und Umordnung tolerieren.
//!
//! Abbestellen passiert durch Droppen des Receivers — das Relay räumt
//! geschlossene Abonnenten beim nächsten `publish` auf.

use super::messages::{CallId, SignalingMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Kapazität eines Abonnenten-Kanals
const SUBSCRIBER_CAPACITY: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Relay connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Subscription for call {0} is already active")]
    AlreadySubscribed(CallId),

    #[error("Subscription for call {0} was lost")]
    SubscriptionLost(CallId),
}

// ============================================================================
// RELAY TRAIT
// ============================================================================

/// Signaling-Relay: publish/subscribe pro Call-ID
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Publiziert eine Nachricht auf dem Kanal ihrer Call-ID.
    ///
    /// Kein interner Retry — Fehler gehen an den Aufrufer.
    async fn publish(&self, msg: SignalingMessage) -> Result<(), TransportError>;

    /// Abonniert alle Nachrichten einer Call-ID ab jetzt.
    ///
    /// Der Receiver liefert auch selbst publizierte Nachrichten zurück
    /// (Echo); das Filtern übernimmt der Adapter.
    async fn subscribe(
        &self,
        call_id: &CallId,
    ) -> Result<mpsc::Receiver<SignalingMessage>, TransportError>;
}

// ============================================================================
// IN-MEMORY RELAY
// ============================================================================

/// Prozess-lokales Relay
///
/// Broker für Tests und Embedder, die beide Seiten im selben Prozess
/// betreiben. Keine Retention: Nachrichten vor dem Abonnement sind weg.
#[derive(Default)]
pub struct MemoryRelay {
    channels: Mutex<HashMap<CallId, Vec<mpsc::Sender<SignalingMessage>>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anzahl lebender Abonnenten für eine Call-ID (für Tests)
    pub fn subscriber_count(&self, call_id: &CallId) -> usize {
        self.channels
            .lock()
            .get(call_id)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn publish(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        let senders: Vec<mpsc::Sender<SignalingMessage>> = {
            let mut channels = self.channels.lock();
            if let Some(subs) = channels.get_mut(&msg.call_id) {
                subs.retain(|tx| !tx.is_closed());
                subs.clone()
            } else {
                Vec::new()
            }
        };

        for tx in senders {
            // Abonnent weg ist kein Publish-Fehler
            let _ = tx.send(msg.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        call_id: &CallId,
    ) -> Result<mpsc::Receiver<SignalingMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.channels
            .lock()
            .entry(call_id.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("calls", &self.channels.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::SessionSdp;

    #[tokio::test]
    async fn publish_reaches_all_subscribers_of_the_call() {
        let relay = MemoryRelay::new();
        let call = CallId::new("call-1");
        let other = CallId::new("call-2");

        let mut rx_a = relay.subscribe(&call).await.unwrap();
        let mut rx_b = relay.subscribe(&call).await.unwrap();
        let mut rx_other = relay.subscribe(&other).await.unwrap();

        relay
            .publish(SignalingMessage::offer(
                call.clone(),
                "alice",
                SessionSdp::new("sdp"),
            ))
            .await
            .unwrap();

        assert_eq!(rx_a.recv().await.unwrap().from_user, "alice");
        assert_eq!(rx_b.recv().await.unwrap().from_user, "alice");
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let relay = MemoryRelay::new();
        let call = CallId::new("call-1");

        let rx = relay.subscribe(&call).await.unwrap();
        drop(rx);

        relay
            .publish(SignalingMessage::hangup(call.clone(), "alice"))
            .await
            .unwrap();

        assert_eq!(relay.subscriber_count(&call), 0);
    }
}
