//! Media Engine Adapter
//!
//! Dünne Schicht über der Echtzeit-Media-Engine eines Drittanbieters.
//! Plattform-Eigenheiten (alternative Initialisierung, Audio-Qualität)
//! kommen über [`EngineConfig`] herein, nicht über eigene Adapter-Klassen.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media engine not initialized")]
    NotInitialized,

    #[error("Media engine initialization failed: {0}")]
    InitFailed(String),

    #[error("Failed to join channel {channel}: {reason}")]
    JoinFailed { channel: String, reason: String },

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Media engine error: {0}")]
    Engine(String),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Konfiguration die an `initialize` übergeben wird
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub app_id: String,
    pub token: Option<String>,
    /// Alternative Initialisierung für Plattformen mit bekannten Engine-Bugs
    pub alternate_init: bool,
    pub high_quality_audio: bool,
}

/// Audio-Profil abhängig vom Anruftyp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioProfile {
    Speech,
    SpeechHighQuality,
    VideoCall,
}

impl AudioProfile {
    pub fn for_call(is_video: bool, high_quality: bool) -> Self {
        match (is_video, high_quality) {
            (true, _) => AudioProfile::VideoCall,
            (false, true) => AudioProfile::SpeechHighQuality,
            (false, false) => AudioProfile::Speech,
        }
    }
}

/// Optionen beim Betreten eines Channels (Rolle ist immer "publisher")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    pub publish_audio: bool,
    pub publish_video: bool,
    pub auto_subscribe_video: bool,
    /// Zweiter Low-Res Video-Stream
    pub dual_stream: bool,
    /// Erweiterte Echo-/Rauschunterdrückung der Engine
    pub audio_processing: bool,
}

impl ChannelOptions {
    pub fn for_call(is_video: bool) -> Self {
        Self {
            publish_audio: true,
            publish_video: is_video,
            auto_subscribe_video: is_video,
            dual_stream: is_video,
            audio_processing: true,
        }
    }

    /// Variante für den n-ten Versuch (0 = volle Konfiguration)
    ///
    /// Jeder weitere Versuch verzichtet auf mehr optionale Fähigkeiten.
    /// Die Publish-Flags bleiben unverändert.
    pub fn degraded(&self, attempt: u32) -> Self {
        let mut options = self.clone();
        if attempt >= 1 {
            options.dual_stream = false;
            options.audio_processing = false;
        }
        if attempt >= 2 {
            options.auto_subscribe_video = false;
        }
        options
    }
}

// ============================================================================
// ENGINE EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLeftReason {
    /// Gegenseite hat den Channel verlassen
    Quit,
    /// Verbindung abgerissen, Engine versucht selbst zu reconnecten
    Dropped,
}

/// Events die von der Engine (auf ihrem eigenen Thread) ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Lokaler Transport bereit - sagt nichts über die Gegenseite aus
    LocalJoined { channel: String },
    RemotePeerJoined { channel: String, peer_uid: String },
    RemotePeerLeft {
        channel: String,
        peer_uid: String,
        reason: PeerLeftReason,
    },
    /// Lokale Aufnahme gestoppt oder fehlgeschlagen
    LocalAudioFailed { reason: String },
    LocalAudioRecovered,
    NetworkQuality { rtt_ms: u32, packet_loss: f32 },
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

#[async_trait]
pub trait MediaEngineAdapter: Send + Sync {
    async fn initialize(&self, config: &EngineConfig) -> Result<(), MediaError>;

    async fn configure_audio_profile(&self, profile: AudioProfile) -> Result<(), MediaError>;

    /// Betritt den Channel; kehrt erst nach bestätigtem lokalem Join zurück
    async fn join_channel(&self, channel: &str, options: &ChannelOptions)
        -> Result<(), MediaError>;

    /// Darf jederzeit aufgerufen werden, auch ohne vorherigen Join
    async fn leave_channel(&self) -> Result<(), MediaError>;

    async fn set_local_audio_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    async fn mute_local(&self, muted: bool) -> Result<(), MediaError>;

    async fn set_speakerphone(&self, enabled: bool) -> Result<(), MediaError>;

    /// Tatsächliche Audio-Route laut Betriebssystem
    async fn speakerphone_enabled(&self) -> Result<bool, MediaError>;

    fn events(&self) -> BoxStream<'static, EngineEvent>;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_drops_optional_flags_only() {
        let full = ChannelOptions::for_call(true);
        assert!(full.dual_stream && full.audio_processing && full.auto_subscribe_video);

        let second = full.degraded(1);
        assert!(!second.dual_stream);
        assert!(!second.audio_processing);
        assert!(second.auto_subscribe_video);

        let last = full.degraded(2);
        assert!(!last.auto_subscribe_video);
        assert!(last.publish_audio);
        assert!(last.publish_video);
        assert_eq!(full.degraded(5), last);
    }

    #[test]
    fn test_voice_call_never_publishes_video() {
        let options = ChannelOptions::for_call(false);
        assert!(options.publish_audio);
        assert!(!options.publish_video);
        assert_eq!(AudioProfile::for_call(false, true), AudioProfile::SpeechHighQuality);
        assert_eq!(AudioProfile::for_call(true, false), AudioProfile::VideoCall);
    }
}
