//! Call Record Store
//!
//! Der Store hält die Anruf-Metadaten; Geschäftslogik (Abrechnung,
//! Verlauf, Benachrichtigungen) gehört dem Embedder. Die Engine schreibt
//! nur Status-Übergänge und löscht nie einen Datensatz.

use crate::signaling::{CallId, SessionSdp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("No record for call {0}")]
    NotFound(CallId),

    #[error("Store backend error: {0}")]
    Backend(String),
}

// ============================================================================
// RECORD
// ============================================================================

/// Status eines Anruf-Datensatzes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRecordStatus {
    Ringing,
    Active,
    Ended,
}

/// Anruf-Metadaten
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: CallId,
    pub status: CallRecordStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    /// Answer-Payload der erfolgreichen Callee-Negotiation
    pub answer_sdp: Option<SessionSdp>,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

#[async_trait]
pub trait CallStore: Send + Sync {
    /// Legt den Datensatz an (falls neu) und markiert ihn `ringing`
    async fn mark_ringing(&self, call_id: &CallId) -> Result<(), StoreError>;

    /// Markiert den Anruf `active` und hinterlegt das Answer-Payload
    async fn mark_active(&self, call_id: &CallId, answer: &SessionSdp) -> Result<(), StoreError>;

    /// Markiert den Anruf `ended` und schreibt Endzeit plus Dauer
    async fn mark_ended(
        &self,
        call_id: &CallId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError>;

    /// Anrufe, die die Gegenseite über den Store beendet hat
    ///
    /// Push statt Polling: jede remote beendete Call-ID wird hier
    /// broadcastet; laufende Sessions beenden sich daraufhin ohne
    /// eigenes Hangup-Publish.
    fn ended_remotely(&self) -> broadcast::Receiver<CallId>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Prozess-lokaler Store für Tests und einfache Embedder
pub struct MemoryCallStore {
    records: RwLock<HashMap<CallId, CallRecord>>,
    ended_tx: broadcast::Sender<CallId>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        let (ended_tx, _) = broadcast::channel(16);
        Self {
            records: RwLock::new(HashMap::new()),
            ended_tx,
        }
    }

    /// Simuliert das Store-Update der Gegenseite: markiert den Anruf
    /// beendet und benachrichtigt laufende Sessions
    pub fn end_remotely(&self, call_id: &CallId) {
        let now = Utc::now();
        {
            let mut records = self.records.write();
            if let Some(record) = records.get_mut(call_id) {
                record.status = CallRecordStatus::Ended;
                record.ended_at = Some(now);
                record.duration_secs = Some((now - record.started_at).num_seconds());
            }
        }
        let _ = self.ended_tx.send(call_id.clone());
    }
}

impl Default for MemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn mark_ringing(&self, call_id: &CallId) -> Result<(), StoreError> {
        let mut records = self.records.write();
        records
            .entry(call_id.clone())
            .or_insert_with(|| CallRecord {
                call_id: call_id.clone(),
                status: CallRecordStatus::Ringing,
                started_at: Utc::now(),
                ended_at: None,
                duration_secs: None,
                answer_sdp: None,
            })
            .status = CallRecordStatus::Ringing;
        Ok(())
    }

    async fn mark_active(&self, call_id: &CallId, answer: &SessionSdp) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.clone()))?;
        record.status = CallRecordStatus::Active;
        record.answer_sdp = Some(answer.clone());
        Ok(())
    }

    async fn mark_ended(
        &self,
        call_id: &CallId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.clone()))?;
        record.status = CallRecordStatus::Ended;
        record.ended_at = Some(ended_at);
        record.duration_secs = Some((ended_at - record.started_at).num_seconds());
        Ok(())
    }

    async fn get(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.records.read().get(call_id).cloned())
    }

    fn ended_remotely(&self) -> broadcast::Receiver<CallId> {
        self.ended_tx.subscribe()
    }
}

impl std::fmt::Debug for MemoryCallStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCallStore")
            .field("records", &self.records.read().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_is_recorded() {
        let store = MemoryCallStore::new();
        let call = CallId::new("call-1");

        store.mark_ringing(&call).await.unwrap();
        store
            .mark_active(&call, &SessionSdp::new("answer"))
            .await
            .unwrap();

        let record = store.get(&call).await.unwrap().unwrap();
        assert_eq!(record.status, CallRecordStatus::Active);
        assert!(record.answer_sdp.is_some());

        store.mark_ended(&call, Utc::now()).await.unwrap();
        let record = store.get(&call).await.unwrap().unwrap();
        assert_eq!(record.status, CallRecordStatus::Ended);
        assert!(record.ended_at.is_some());
        assert!(record.duration_secs.is_some());
    }

    #[tokio::test]
    async fn ending_unknown_call_is_an_error() {
        let store = MemoryCallStore::new();
        let result = store.mark_ended(&CallId::new("nope"), Utc::now()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn remote_end_is_broadcast() {
        let store = MemoryCallStore::new();
        let call = CallId::new("call-1");
        store.mark_ringing(&call).await.unwrap();

        let mut rx = store.ended_remotely();
        store.end_remotely(&call);

        assert_eq!(rx.recv().await.unwrap(), call);
        let record = store.get(&call).await.unwrap().unwrap();
        assert_eq!(record.status, CallRecordStatus::Ended);
    }
}
