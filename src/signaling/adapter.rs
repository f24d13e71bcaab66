//! Signaling Transport Adapter
//!
//! Kapselt das Relay für genau eine Engine-Instanz:
//! - filtert selbst publizierte Nachrichten (Echo) heraus
//! - stellt pro Call-ID höchstens ein lebendes Abonnement sicher
//! - leitet verbleibende Nachrichten in den Session-Kanal weiter
//!
//! Endet der Relay-Strom, schließt sich der Session-Kanal — die Session
//! sieht den Verlust als geschlossenen Receiver.

use super::messages::{CallId, SignalingMessage};
use super::relay::{SignalingRelay, TransportError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// ADAPTER
// ============================================================================

/// Adapter zwischen Relay und Call-Sessions
pub struct SignalingAdapter {
    relay: Arc<dyn SignalingRelay>,
    self_user: String,
    active: Arc<Mutex<HashSet<CallId>>>,
}

impl SignalingAdapter {
    pub fn new(relay: Arc<dyn SignalingRelay>, self_user: impl Into<String>) -> Self {
        Self {
            relay,
            self_user: self_user.into(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn self_user(&self) -> &str {
        &self.self_user
    }

    /// Publiziert eine Nachricht; kein interner Retry
    pub async fn publish(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        tracing::debug!("Publishing {} for call {}", msg.signal.kind(), msg.call_id);
        self.relay.publish(msg).await
    }

    /// Öffnet das Abonnement für eine Call-ID
    ///
    /// Gefilterte Nachrichten landen in `tx`. Das zurückgegebene
    /// `Subscription`-Handle beendet beim Droppen den Forward-Task und
    /// gibt die Call-ID wieder frei.
    pub async fn subscribe(
        &self,
        call_id: &CallId,
        tx: mpsc::Sender<SignalingMessage>,
    ) -> Result<Subscription, TransportError> {
        {
            let mut active = self.active.lock();
            if !active.insert(call_id.clone()) {
                return Err(TransportError::AlreadySubscribed(call_id.clone()));
            }
        }

        let mut relay_rx = match self.relay.subscribe(call_id).await {
            Ok(rx) => rx,
            Err(e) => {
                self.active.lock().remove(call_id);
                return Err(e);
            }
        };

        let self_user = self.self_user.clone();
        let id = call_id.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = relay_rx.recv().await {
                if msg.from_user == self_user {
                    tracing::trace!("Ignoring own {} echo for call {}", msg.signal.kind(), id);
                    continue;
                }
                if tx.send(msg).await.is_err() {
                    // Session weg, Abonnement läuft ins Leere
                    break;
                }
            }
            tracing::debug!("Signaling forward for call {} ended", id);
        });

        Ok(Subscription {
            call_id: call_id.clone(),
            active: Arc::clone(&self.active),
            task,
        })
    }
}

impl std::fmt::Debug for SignalingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingAdapter")
            .field("self_user", &self.self_user)
            .field("active_calls", &self.active.lock().len())
            .finish()
    }
}

// ============================================================================
// SUBSCRIPTION HANDLE
// ============================================================================

/// Lebendes Abonnement einer Call-ID
///
/// Muss beim Session-Teardown gedroppt werden, sonst leckt die
/// Zustellung in einen Folge-Anruf mit derselben Transport-Instanz.
pub struct Subscription {
    call_id: CallId,
    active: Arc<Mutex<HashSet<CallId>>>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        self.active.lock().remove(&self.call_id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("call_id", &self.call_id)
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
    use crate::signaling::relay::MemoryRelay;

    fn offer(call: &CallId, from: &str) -> SignalingMessage {
        SignalingMessage::offer(call.clone(), from, SessionSdp::new("sdp"))
    }

    #[tokio::test]
    async fn own_messages_are_filtered() {
        let relay = Arc::new(MemoryRelay::new());
        let adapter = SignalingAdapter::new(relay.clone(), "alice");
        let call = CallId::new("call-1");

        let (tx, mut rx) = mpsc::channel(8);
        let _sub = adapter.subscribe(&call, tx).await.unwrap();

        adapter.publish(offer(&call, "alice")).await.unwrap();
        relay.publish(offer(&call, "bob")).await.unwrap();

        // Nur Bobs Offer kommt durch
        let got = rx.recv().await.unwrap();
        assert_eq!(got.from_user, "bob");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_subscription_for_same_call_is_refused() {
        let relay = Arc::new(MemoryRelay::new());
        let adapter = SignalingAdapter::new(relay, "alice");
        let call = CallId::new("call-1");

        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);

        let sub = adapter.subscribe(&call, tx_a).await.unwrap();
        assert!(matches!(
            adapter.subscribe(&call, tx_b.clone()).await,
            Err(TransportError::AlreadySubscribed(_))
        ));

        // Nach dem Drop ist die Call-ID wieder frei
        drop(sub);
        assert!(adapter.subscribe(&call, tx_b).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_subscription_closes_the_session_channel() {
        let relay = Arc::new(MemoryRelay::new());
        let adapter = SignalingAdapter::new(relay.clone(), "alice");
        let call = CallId::new("call-1");

        let (tx, mut rx) = mpsc::channel(8);
        let sub = adapter.subscribe(&call, tx).await.unwrap();

        drop(sub);
        assert!(rx.recv().await.is_none());
    }
}
