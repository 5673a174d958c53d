//! Recovery Policy für den Channel-Join
//!
//! Der erste Join schlägt in der Praxis oft fehl (Engine noch nicht
//! bereit, Audio-Gerät kurz belegt). Wir versuchen es daher einige Male
//! mit kurzer Pause und jeweils minimalerer Channel-Konfiguration.

use crate::media::{ChannelOptions, MediaEngineAdapter, MediaError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Begrenzte Wiederholung mit Fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Gesamtzahl der Join-Versuche (inklusive dem ersten)
    pub max_attempts: u32,
    /// Pause nach dem n-ten Fehlschlag: n * backoff_ms (+ Jitter)
    pub backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 400,
            jitter_ms: 100,
        }
    }
}

/// Erfolgreicher Join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub attempts: u32,
    /// Konfiguration mit der der Join geklappt hat
    pub options: ChannelOptions,
}

/// Alle Versuche aufgebraucht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFailure {
    pub attempts: u32,
    pub last_error: MediaError,
}

impl RecoveryPolicy {
    /// Pause nach `failed_attempts` Fehlschlägen
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.backoff_ms * u64::from(failed_attempts) + jitter)
    }

    /// Betritt `channel`, notfalls über mehrere Versuche
    pub async fn join(
        &self,
        engine: &dyn MediaEngineAdapter,
        channel: &str,
        options: &ChannelOptions,
    ) -> Result<JoinOutcome, JoinFailure> {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = MediaError::NotInitialized;

        for attempt in 0..max_attempts {
            let attempt_options = options.degraded(attempt);

            match engine.join_channel(channel, &attempt_options).await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Joined channel {} on attempt {}/{}",
                            channel,
                            attempt + 1,
                            max_attempts
                        );
                    }
                    return Ok(JoinOutcome {
                        attempts: attempt + 1,
                        options: attempt_options,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Join attempt {}/{} for channel {} failed: {}",
                        attempt + 1,
                        max_attempts,
                        channel,
                        e
                    );
                    last_error = e;
                }
            }

            if attempt + 1 < max_attempts {
                tokio::time::sleep(self.backoff(attempt + 1)).await;
            }
        }

        Err(JoinFailure {
            attempts: max_attempts,
            last_error,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
