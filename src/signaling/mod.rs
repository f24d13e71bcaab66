//! Signaling Module — Relay-Transport für Offer/Answer/Candidates
//!
//! Dieses Modul verwaltet den Out-of-Band-Kanal zwischen den Parteien:
//! - Wire-Format der Signaling-Nachrichten (geschlossene tagged Union)
//! - Relay-Abstraktion (in-memory und WebSocket)
//! - Adapter mit Echo-Filter und Abonnement-Verwaltung pro Call-ID

mod adapter;
mod messages;
mod relay;
mod ws;

pub use adapter::{SignalingAdapter, Subscription};
pub use messages::{CallId, CandidateSdp, SessionSdp, SignalPayload, SignalingMessage};
pub use relay::{MemoryRelay, SignalingRelay, TransportError};
pub use ws::WsRelay;
