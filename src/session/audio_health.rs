//! Audio-Health-Check
//!
//! Manche Engine-Versionen stoppen die lokale Aufnahme ohne Fehlermeldung.
//! Meldet die Engine `LocalAudioFailed`, setzen wir die Aufnahme beim
//! nächsten Check zurück (aus -> warten -> an), aber nur begrenzt oft.

use crate::media::{MediaEngineAdapter, MediaError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioHealthConfig {
    pub check_interval_secs: u64,
    pub reset_delay_ms: u64,
    /// Maximale Anzahl Resets pro Anruf
    pub max_resets: u32,
}

impl Default for AudioHealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            reset_delay_ms: 500,
            max_resets: 3,
        }
    }
}

impl AudioHealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

/// Audio-Zustand eines einzelnen Anrufs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct AudioHealthMonitor {
    failed: bool,
    resetting: bool,
    resets: u32,
}

impl AudioHealthMonitor {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn mark_recovered(&mut self) {
        self.failed = false;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Ein Reset läuft, die Aufnahme ist evtl. gerade aus
    pub fn is_resetting(&self) -> bool {
        self.resetting
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn should_reset(&self, max_resets: u32) -> bool {
        self.failed && !self.resetting && self.resets < max_resets
    }

    pub fn begin_reset(&mut self) {
        self.resetting = true;
        self.resets += 1;
    }

    pub fn finish_reset(&mut self, succeeded: bool) {
        self.resetting = false;
        if succeeded {
            self.failed = false;
        }
    }
}

/// Schaltet die lokale Aufnahme aus und nach `delay` wieder an
pub(crate) async fn reset_local_audio(
    engine: &dyn MediaEngineAdapter,
    delay: Duration,
) -> Result<(), MediaError> {
    engine.set_local_audio_enabled(false).await?;
    tokio::time::sleep(delay).await;
    engine.set_local_audio_enabled(true).await
}

// ============================================================================
// TESTS
// ============================================================================
