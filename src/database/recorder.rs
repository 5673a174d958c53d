//! Schreibt abgeschlossene Anrufe ins Anrufprotokoll

use super::call_log::{CallLog, CallLogEntry};
use crate::session::CallStateChanged;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Hintergrund-Task, der jeden Endzustand als Zeile ablegt
///
/// Läuft bis der Event-Strom endet oder der Recorder gedroppt wird.
pub struct CallLogRecorder {
    task: JoinHandle<()>,
}

impl CallLogRecorder {
    pub fn spawn(log: Arc<CallLog>, mut events: BoxStream<'static, CallStateChanged>) -> Self {
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(entry) = entry_for(&event) else {
                    continue;
                };
                if let Err(e) = log.record(&entry) {
                    tracing::error!("Failed to write call log for {}: {}", entry.call_id, e);
                }
            }
            tracing::debug!("Call log recorder stopped");
        });

        Self { task }
    }
}

impl Drop for CallLogRecorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn entry_for(event: &CallStateChanged) -> Option<CallLogEntry> {
    if !event.current.is_terminal() {
        return None;
    }
    let call = event.call.as_ref()?;

    Some(CallLogEntry {
        call_id: call.call_id.clone(),
        peer_id: call.peer_id.clone(),
        role: call.role,
        is_video: call.is_video,
        outcome: event.current,
        duration_secs: call.duration_secs.unwrap_or(0),
        ended_at: Utc::now(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
