//! Signaling Store Schnittstelle
//!
//! Der Store ist eine Dokument-Datenbank mit Echtzeit-Subscriptions.
//! Pro Dokument wird eine totale Ordnung garantiert, zwischen den
//! Peers aber keine. Snapshots können doppelt ankommen.

use super::record::{CallStatus, RecordUpdate, SignalingRecord};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Call record not found: {0}")]
    NotFound(String),

    #[error("Call record already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid status transition for {call_id}: {current} -> {requested}")]
    InvalidTransition {
        call_id: String,
        current: CallStatus,
        requested: CallStatus,
    },

    #[error("Not authenticated with signaling store")]
    Unauthenticated,

    #[error("Signaling store unavailable: {0}")]
    Unavailable(String),

    #[error("Signaling store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Fehler bei denen sich ein erneuter Versuch lohnt
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Backend(_))
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Strom von Record-Snapshots
pub type RecordStream = BoxStream<'static, SignalingRecord>;

#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Legt einen neuen Record an
    async fn create(&self, record: SignalingRecord) -> Result<(), StoreError>;

    /// Ändert Felder eines Records und gibt den neuen Stand zurück
    async fn update(
        &self,
        call_id: &str,
        update: RecordUpdate,
    ) -> Result<SignalingRecord, StoreError>;

    async fn get(&self, call_id: &str) -> Result<SignalingRecord, StoreError>;

    /// Snapshots eines einzelnen Records (aktueller Stand zuerst)
    async fn subscribe(&self, call_id: &str) -> Result<RecordStream, StoreError>;

    /// Records mit `receiverId == self_id` und `status == ringing`
    async fn subscribe_incoming(&self, self_id: &str) -> Result<RecordStream, StoreError>;
}

// ============================================================================
// HELPERS
// ============================================================================

/// Macht aus einem broadcast::Receiver einen Stream
///
/// Verpasste Nachrichten (Lagged) werden übersprungen, der Stream endet
/// erst wenn der Sender geschlossen wird.
pub fn receiver_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber lagged behind, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Liest den aktuellen Stand eines Records neu ein
pub(crate) type Refetch =
    Box<dyn Fn() -> BoxFuture<'static, Option<SignalingRecord>> + Send + Sync>;

/// Filtert einen Snapshot-Strom auf einen Record, aktueller Stand vorneweg
///
/// Ist der Subscriber zurückgefallen, wird der Record per `refetch` neu
/// gelesen, ein verpasster Endzustand geht so nicht verloren.
pub(crate) fn record_stream(
    initial: Option<SignalingRecord>,
    rx: broadcast::Receiver<SignalingRecord>,
    call_id: &str,
    refetch: Refetch,
) -> RecordStream {
    let live = futures::stream::unfold(
        (rx, refetch, call_id.to_string()),
        |(mut rx, refetch, call_id)| async move {
            loop {
                match rx.recv().await {
                    Ok(record) if record.call_id == call_id => {
                        return Some((record, (rx, refetch, call_id)));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Subscription for {} lagged behind by {} messages, re-reading record",
                            call_id,
                            skipped
                        );
                        if let Some(record) = refetch().await {
                            return Some((record, (rx, refetch, call_id)));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    futures::stream::iter(initial).chain(live).boxed()
}

/// Filtert einen Snapshot-Strom auf klingelnde Anrufe für `self_id`
pub(crate) fn incoming_stream(
    initial: Vec<SignalingRecord>,
    rx: broadcast::Receiver<SignalingRecord>,
    self_id: &str,
) -> RecordStream {
    let self_id = self_id.to_string();
    futures::stream::iter(initial)
        .chain(receiver_stream(rx).filter(move |record| {
            futures::future::ready(
                record.receiver_id == self_id && record.status == CallStatus::Ringing,
            )
        }))
        .boxed()
}
