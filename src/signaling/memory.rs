//! In-Process Signaling Store
//!
//! Hält alle Records im Speicher und verteilt Änderungen über einen
//! broadcast-Kanal. Erzwingt dieselben Regeln wie der entfernte Store:
//! eine `callId` nur einmal, Status nur entlang gültiger Kanten.

use super::record::{CallStatus, RecordUpdate, SignalingRecord};
use super::store::{
    incoming_stream, record_stream, RecordStream, Refetch, SignalingStore, StoreError,
};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Speicherbasierter Signaling Store
pub struct MemorySignalingStore {
    records: Arc<RwLock<HashMap<String, SignalingRecord>>>,
    changes: broadcast::Sender<SignalingRecord>,
}

impl MemorySignalingStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);

        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Anrufhistorie eines Benutzers, neueste zuerst
    pub fn history(&self, user_id: &str) -> Vec<SignalingRecord> {
        let mut records: Vec<SignalingRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.caller_id == user_id || r.receiver_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for MemorySignalingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn create(&self, record: SignalingRecord) -> Result<(), StoreError> {
        {
            let mut records = self.records.write();
            if records.contains_key(&record.call_id) {
                return Err(StoreError::AlreadyExists(record.call_id));
            }
            records.insert(record.call_id.clone(), record.clone());
        }

        tracing::debug!("Record {} created ({})", record.call_id, record.status);
        let _ = self.changes.send(record);
        Ok(())
    }

    async fn update(
        &self,
        call_id: &str,
        update: RecordUpdate,
    ) -> Result<SignalingRecord, StoreError> {
        let updated = {
            let mut records = self.records.write();
            let record = records
                .get_mut(call_id)
                .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;

            if !record.apply(&update) {
                return Err(StoreError::InvalidTransition {
                    call_id: call_id.to_string(),
                    current: record.status,
                    requested: update.status,
                });
            }
            record.clone()
        };

        tracing::debug!("Record {} updated to {}", call_id, updated.status);
        let _ = self.changes.send(updated.clone());
        Ok(updated)
    }

    async fn get(&self, call_id: &str) -> Result<SignalingRecord, StoreError> {
        self.records
            .read()
            .get(call_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))
    }

    async fn subscribe(&self, call_id: &str) -> Result<RecordStream, StoreError> {
        // Erst abonnieren, dann lesen: lieber doppelt als verloren
        let rx = self.changes.subscribe();
        let initial = self.records.read().get(call_id).cloned();

        let records = Arc::clone(&self.records);
        let id = call_id.to_string();
        let refetch: Refetch = Box::new(move || {
            let current = records.read().get(&id).cloned();
            futures::future::ready(current).boxed()
        });
        Ok(record_stream(initial, rx, call_id, refetch))
    }

    async fn subscribe_incoming(&self, self_id: &str) -> Result<RecordStream, StoreError> {
        let rx = self.changes.subscribe();
        let initial: Vec<SignalingRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.receiver_id == self_id && r.status == CallStatus::Ringing)
            .cloned()
            .collect();
        Ok(incoming_stream(initial, rx, self_id))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_rejects_duplicate_call_id() {
        let store = MemorySignalingStore::new();
        let record = SignalingRecord::new_outgoing("alice", "bob", false);

        store.create(record.clone()).await.unwrap();
        let err = store.create(record.clone()).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(record.call_id));
    }

    #[tokio::test]
    async fn test_update_enforces_transitions() {
        let store = MemorySignalingStore::new();
        let record = SignalingRecord::new_outgoing("alice", "bob", false);
        let call_id = record.call_id.clone();
        store.create(record).await.unwrap();

        let updated = store
            .update(&call_id, RecordUpdate::answered())
            .await
            .unwrap();
        assert_eq!(updated.status, CallStatus::Ongoing);

        let err = store
            .update(&call_id, RecordUpdate::missed("bob"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                call_id: call_id.clone(),
                current: CallStatus::Ongoing,
                requested: CallStatus::Missed,
            }
        );

        let missing = store.update("nope", RecordUpdate::ended(1)).await;
        assert_eq!(missing.unwrap_err(), StoreError::NotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_then_changes() {
        let store = MemorySignalingStore::new();
        let record = SignalingRecord::new_outgoing("alice", "bob", false);
        let call_id = record.call_id.clone();
        store.create(record).await.unwrap();

        // Rauschen eines anderen Anrufs darf nicht durchkommen
        let other = SignalingRecord::new_outgoing("carol", "bob", false);

        let mut stream = store.subscribe(&call_id).await.unwrap();
        store.create(other).await.unwrap();
        store
            .update(&call_id, RecordUpdate::answered())
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.status, CallStatus::Ringing);
        let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.call_id, call_id);
        assert_eq!(second.status, CallStatus::Ongoing);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_rereads_record() {
        let store = MemorySignalingStore::new();
        let record = SignalingRecord::new_outgoing("alice", "bob", false);
        let call_id = record.call_id.clone();
        store.create(record).await.unwrap();

        let mut stream = store.subscribe(&call_id).await.unwrap();
        assert_eq!(stream.next().await.unwrap().status, CallStatus::Ringing);

        // Mehr fremde Änderungen als der Kanal puffert, dann der Endzustand
        for _ in 0..300 {
            store
                .create(SignalingRecord::new_outgoing("carol", "dave", false))
                .await
                .unwrap();
        }
        store
            .update(&call_id, RecordUpdate::missed("bob"))
            .await
            .unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.call_id, call_id);
        assert_eq!(next.status, CallStatus::Missed);
    }

    #[tokio::test]
    async fn test_subscribe_incoming_filters_receiver_and_status() {
        let store = MemorySignalingStore::new();
        let waiting = SignalingRecord::new_outgoing("alice", "bob", false);
        store.create(waiting.clone()).await.unwrap();

        let mut incoming = store.subscribe_incoming("bob").await.unwrap();
        assert_eq!(incoming.next().await.unwrap().call_id, waiting.call_id);

        // Update auf ongoing ist kein eingehender Anruf mehr
        store
            .update(&waiting.call_id, RecordUpdate::answered())
            .await
            .unwrap();
        // Anruf an jemand anderen
        store
            .create(SignalingRecord::new_outgoing("alice", "carol", false))
            .await
            .unwrap();
        let next = SignalingRecord::new_outgoing("dave", "bob", true);
        store.create(next.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), incoming.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.call_id, next.call_id);
    }

    #[tokio::test]
    async fn test_history_keeps_finished_calls() {
        let store = MemorySignalingStore::new();
        let record = SignalingRecord::new_outgoing("alice", "bob", false);
        store.create(record.clone()).await.unwrap();
        store
            .update(&record.call_id, RecordUpdate::declined())
            .await
            .unwrap();

        let history = store.history("bob");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CallStatus::Declined);
        assert!(store.history("carol").is_empty());
    }
}
