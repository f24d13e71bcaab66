//! WebSocket-Relay Client
//!
//! Verbindet sich mit einem Relay-Server über WebSocket und setzt das
//! `SignalingRelay` Interface darauf um:
//! - Read-Task parst eingehende Frames und verteilt sie an die
//!   Abonnenten der jeweiligen Call-ID
//! - Write-Task entleert eine mpsc-Outbox in den Socket
//! - Verbindungsverlust schließt alle Abonnenten-Kanäle

use super::messages::{CallId, SignalingMessage};
use super::relay::{SignalingRelay, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Kapazität eines Abonnenten-Kanals
const SUBSCRIBER_CAPACITY: usize = 64;

/// Kapazität der Outbox
const OUTBOX_CAPACITY: usize = 100;

type SubscriberMap = Arc<Mutex<HashMap<CallId, Vec<mpsc::Sender<SignalingMessage>>>>>;

/// Leitet den WebSocket-Endpunkt aus der Basis-URL ab: Schema wird auf
/// ws/wss umgestellt, der Pfad um `/ws` ergänzt
fn ws_endpoint(server_url: &str) -> Result<String, TransportError> {
    let mut base =
        Url::parse(server_url).map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    base.set_scheme(scheme)
        .map_err(|_| TransportError::ConnectionFailed(format!("invalid relay url: {server_url}")))?;

    Ok(format!("{}/ws", base.as_str().trim_end_matches('/')))
}

// ============================================================================
// WS RELAY
// ============================================================================

/// WebSocket-basiertes Signaling-Relay
pub struct WsRelay {
    server_url: String,
    outbox: mpsc::Sender<String>,
    subscribers: SubscriberMap,
    connected: Arc<AtomicBool>,
}

impl WsRelay {
    /// Verbindet mit dem Relay-Server
    ///
    /// `server_url` ist die HTTP(S)-Basis-URL; der WebSocket-Endpunkt
    /// liegt unter `/ws`.
    pub async fn connect(server_url: &str) -> Result<Self, TransportError> {
        let ws_url = ws_endpoint(server_url)?;

        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Read-Task: Frames parsen und an Abonnenten verteilen
        let subscribers_read = Arc::clone(&subscribers);
        let connected_read = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalingMessage>(&text)
                    {
                        Ok(msg) => Self::dispatch(&subscribers_read, msg).await,
                        Err(e) => {
                            tracing::warn!("Dropping unparseable signaling frame: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            connected_read.store(false, Ordering::SeqCst);
            // Alle Abonnenten-Kanäle schließen, damit laufende Sessions
            // den Verbindungsverlust sehen
            subscribers_read.lock().clear();
        });

        // Write-Task: Outbox in den Socket entleeren
        tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            server_url: server_url.to_string(),
            outbox: outbox_tx,
            subscribers,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn dispatch(subscribers: &SubscriberMap, msg: SignalingMessage) {
        let senders: Vec<mpsc::Sender<SignalingMessage>> = {
            let mut map = subscribers.lock();
            if let Some(subs) = map.get_mut(&msg.call_id) {
                subs.retain(|tx| !tx.is_closed());
                subs.clone()
            } else {
                tracing::debug!(
                    "No subscriber for call {}, dropping {}",
                    msg.call_id,
                    msg.signal.kind()
                );
                Vec::new()
            }
        };

        for tx in senders {
            let _ = tx.send(msg.clone()).await;
        }
    }
}

#[async_trait]
impl SignalingRelay for WsRelay {
    async fn publish(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let text = serde_json::to_string(&msg)
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        self.outbox
            .send(text)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    async fn subscribe(
        &self,
        call_id: &CallId,
    ) -> Result<mpsc::Receiver<SignalingMessage>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers
            .lock()
            .entry(call_id.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

impl std::fmt::Debug for WsRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRelay")
            .field("server_url", &self.server_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
