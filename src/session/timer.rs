//! Ring Timeout Timer
//!
//! Ein Timer pro Anruf. Feuert genau einmal, außer er wird vorher
//! abgebrochen. Es gibt bewusst kein `rearm`: ein neuer Anruf bekommt
//! einen neuen Timer.

use std::time::Duration;
use tokio::task::JoinHandle;

/// Single-Shot Timer, gebunden an eine `call_id`
#[derive(Debug)]
pub struct RingTimeoutTimer {
    call_id: String,
    handle: JoinHandle<()>,
}

impl RingTimeoutTimer {
    /// Startet den Timer; `on_fire` bekommt die `call_id` übergeben
    pub fn arm<F>(call_id: &str, timeout: Duration, on_fire: F) -> Self
    where
        F: FnOnce(String) + Send + 'static,
    {
        let id = call_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::debug!("Ring timeout elapsed for call {}", id);
            on_fire(id);
        });

        Self {
            call_id: call_id.to_string(),
            handle,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Bricht den Timer ab (no-op wenn er schon gefeuert hat)
    pub fn cancel(self) {
        tracing::debug!("Ring timer cancelled for call {}", self.call_id);
        drop(self);
    }
}

impl Drop for RingTimeoutTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = RingTimeoutTimer::arm("call-1", Duration::from_secs(30), move |id| {
            let _ = tx.send(id);
        });
        assert_eq!(timer.call_id(), "call-1");

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("call-1"));
        // Closure ist verbraucht, Sender gedroppt
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let timer = RingTimeoutTimer::arm("call-2", Duration::from_secs(30), move |id| {
            let _ = tx.send(id);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(rx.recv().await.is_none());
    }
}
