//! Konfiguration des Call-Session-Coordinators
//!
//! Wird aus `config.json` im Konfigurationsverzeichnis der App geladen:
//! - Windows: `%APPDATA%/pulse/call-session/config/config.json`
//! - macOS: `~/Library/Application Support/com.pulse.call-session/config.json`
//! - Linux: `~/.config/call-session/config.json`
//!
//! Fehlende Felder bekommen Defaults, `SIGNALING_URL` überschreibt die
//! Server-Adresse.

use crate::media::EngineConfig;
use crate::session::{AudioHealthConfig, RecoveryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default Signaling URL (kann über Umgebungsvariable überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// Verbindung zum entfernten Signaling Store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    /// Cloudflare Workers hat einen Idle-Timeout, daher regelmäßige Heartbeats
    pub heartbeat_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            heartbeat_secs: 25,
            request_timeout_secs: 10,
        }
    }
}

impl SignalingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "signaling.heartbeat_secs must be > 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "signaling.request_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub ring_timeout_secs: u64,
    /// Zusätzliche Wartezeit auf Empfängerseite bevor sie selbst aufgibt
    pub incoming_grace_secs: u64,
    /// Wie lange ein Endzustand sichtbar bleibt bevor es zurück nach Idle geht
    pub terminal_linger_ms: u64,
    pub recovery: RecoveryPolicy,
    pub audio_health: AudioHealthConfig,
    pub engine: EngineConfig,
    pub signaling: SignalingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            incoming_grace_secs: 5,
            terminal_linger_ms: 500,
            recovery: RecoveryPolicy::default(),
            audio_health: AudioHealthConfig::default(),
            engine: EngineConfig::default(),
            signaling: SignalingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Lädt die Konfiguration aus dem Standard-Pfad
    ///
    /// Existiert keine Datei, werden die Defaults verwendet.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;

        let mut config = if path.exists() {
            tracing::info!("Loading config from {:?}", path);
            Self::parse_file(&path)?
        } else {
            tracing::info!("No config at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Lädt eine explizite Konfigurationsdatei
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("com", "pulse", "call-session")
            .ok_or(ConfigError::NoConfigDir)?;

        let mut path = proj_dirs.config_dir().to_path_buf();
        path.push("config.json");
        Ok(path)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("SIGNALING_URL") {
            tracing::debug!("Signaling URL overridden from environment");
            self.signaling.url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ring_timeout_secs must be > 0".into()));
        }
        if self.recovery.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "recovery.max_attempts must be > 0".into(),
            ));
        }
        if self.audio_health.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "audio_health.check_interval_secs must be > 0".into(),
            ));
        }
        self.signaling.validate()
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    /// Wie lange ein eingehender Anruf maximal klingeln darf
    pub fn incoming_ring_window(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs + self.incoming_grace_secs)
    }

    pub fn terminal_linger(&self) -> Duration {
        Duration::from_millis(self.terminal_linger_ms)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.ring_timeout(), Duration::from_secs(30));
        assert_eq!(config.incoming_ring_window(), Duration::from_secs(35));
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.signaling.heartbeat_secs, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "ring_timeout_secs": 45,
                "recovery": { "max_attempts": 2 },
                "engine": { "app_id": "demo-app", "alternate_init": true }
            }"#,
        )
        .unwrap();

        let config = CoordinatorConfig::load_from(&path).unwrap();
        assert_eq!(config.ring_timeout_secs, 45);
        assert_eq!(config.recovery.max_attempts, 2);
        assert_eq!(config.recovery.backoff_ms, 400);
        assert_eq!(config.engine.app_id, "demo-app");
        assert!(config.engine.alternate_init);
        assert_eq!(config.audio_health, AudioHealthConfig::default());
    }

    #[test]
    fn test_rejects_zero_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "recovery": { "max_attempts": 0 } }"#).unwrap();

        let err = CoordinatorConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let mut config = CoordinatorConfig::default();
        config.signaling.heartbeat_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CoordinatorConfig::default();
        config.audio_health.check_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoordinatorConfig::load_from(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
