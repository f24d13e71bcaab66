//! Message Types für das Signaling-Protokoll
//!
//! Das Wire-Format ist eine geschlossene tagged Union: jede Nachricht
//! trägt `signal_type` und (außer bei Hangup) ein `signal_data` Payload.
//! Unbekannte Tags schlagen beim Deserialisieren fehl und werden an der
//! Transport-Grenze verworfen — nie still weitergereicht.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CALL ID
// ============================================================================

/// Eindeutige Kennung eines Anrufs (beide Seiten verwenden dieselbe ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Erzeugt eine frische Call-ID (UUIDv4)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

/// Session Description (Offer oder Answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSdp {
    pub sdp: String,
}

impl SessionSdp {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// ICE Candidate, spiegelt `RTCIceCandidateInit`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSdp {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub sdp_mline_index: Option<u16>,
}

impl CandidateSdp {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// SIGNAL UNION
// ============================================================================

/// Alle möglichen Signal-Arten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal_type", content = "signal_data", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// SDP Offer (initial oder ICE-Restart)
    Offer(SessionSdp),

    /// SDP Answer
    Answer(SessionSdp),

    /// ICE Candidate
    IceCandidate(CandidateSdp),

    /// Gegenseite hat aufgelegt
    Hangup,
}

impl SignalPayload {
    /// Tag-Name, z.B. für Logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::IceCandidate(_) => "ice-candidate",
            SignalPayload::Hangup => "hangup",
        }
    }
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Eine Signaling-Nachricht auf dem Relay-Kanal
///
/// Immutable nach Konstruktion; existiert nur im Transit durch den
/// Transport-Adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub call_id: CallId,
    pub from_user: String,
    #[serde(flatten)]
    pub signal: SignalPayload,
    /// Millisekunden seit Unix-Epoch (UTC)
    pub sent_at: i64,
}

impl SignalingMessage {
    pub fn new(call_id: CallId, from_user: impl Into<String>, signal: SignalPayload) -> Self {
        Self {
            call_id,
            from_user: from_user.into(),
            signal,
            sent_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn offer(call_id: CallId, from_user: impl Into<String>, sdp: SessionSdp) -> Self {
        Self::new(call_id, from_user, SignalPayload::Offer(sdp))
    }

    pub fn answer(call_id: CallId, from_user: impl Into<String>, sdp: SessionSdp) -> Self {
        Self::new(call_id, from_user, SignalPayload::Answer(sdp))
    }

    pub fn ice_candidate(
        call_id: CallId,
        from_user: impl Into<String>,
        candidate: CandidateSdp,
    ) -> Self {
        Self::new(call_id, from_user, SignalPayload::IceCandidate(candidate))
    }

    pub fn hangup(call_id: CallId, from_user: impl Into<String>) -> Self {
        Self::new(call_id, from_user, SignalPayload::Hangup)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_wire_shape() {
        let msg =
            SignalingMessage::offer(CallId::new("call-1"), "alice", SessionSdp::new("v=0\r\n"));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["call_id"], "call-1");
        assert_eq!(json["from_user"], "alice");
        assert_eq!(json["signal_type"], "offer");
        assert_eq!(json["signal_data"]["sdp"], "v=0\r\n");
        assert!(json["sent_at"].is_i64());
    }

    #[test]
    fn hangup_has_no_payload() {
        let msg = SignalingMessage::hangup(CallId::new("call-1"), "bob");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["signal_type"], "hangup");
        assert!(json.get("signal_data").is_none());
    }

    #[test]
    fn candidate_roundtrip() {
        let mut candidate =
            CandidateSdp::new("candidate:1 1 UDP 2122252543 10.0.0.2 54321 typ host");
        candidate.sdp_mid = Some("0".to_string());
        candidate.sdp_mline_index = Some(0);

        let msg =
            SignalingMessage::ice_candidate(CallId::new("call-1"), "alice", candidate.clone());
        let text = serde_json::to_string(&msg).unwrap();
        let parsed: SignalingMessage = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed.signal, SignalPayload::IceCandidate(candidate));
    }

    #[test]
    fn unknown_signal_type_is_rejected() {
        let raw = r#"{
            "call_id": "call-1",
            "from_user": "mallory",
            "signal_type": "renegotiate-everything",
            "signal_data": {},
            "sent_at": 0
        }"#;
        assert!(serde_json::from_str::<SignalingMessage>(raw).is_err());
    }
}
