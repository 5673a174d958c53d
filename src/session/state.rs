//! Call States und Events für die UI-Anbindung

use super::error::CallError;
use crate::signaling::CallStatus;
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL ROLE
// ============================================================================

/// Rolle dieses Geräts im aktuellen Anruf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Receiver,
}

impl CallRole {
    pub fn as_str(self) -> &'static str {
        match self {
            CallRole::Caller => "caller",
            CallRole::Receiver => "receiver",
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Lokaler Zustand der Zustandsmaschine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf klingelt beim Gegenüber
    OutgoingRinging,
    /// Eingehender Anruf wartet auf Antwort
    IncomingRinging,
    /// Angenommen, Media-Channel wird aufgebaut
    Connecting,
    /// Gespräch läuft
    Ongoing,
    /// Abbau läuft
    Ending,
    Ended,
    Declined,
    Missed,
    Error,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::OutgoingRinging => "outgoing_ringing",
            CallState::IncomingRinging => "incoming_ringing",
            CallState::Connecting => "connecting",
            CallState::Ongoing => "ongoing",
            CallState::Ending => "ending",
            CallState::Ended => "ended",
            CallState::Declined => "declined",
            CallState::Missed => "missed",
            CallState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Ended | CallState::Declined | CallState::Missed | CallState::Error
        )
    }

    /// Ein Anruf läuft (weder Idle noch Endzustand)
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != CallState::Idle
    }

    /// Lokaler Endzustand zu einem terminalen Record-Status
    pub fn from_terminal_status(status: CallStatus) -> Option<Self> {
        match status {
            CallStatus::Ended => Some(CallState::Ended),
            CallStatus::Declined => Some(CallState::Declined),
            CallStatus::Missed => Some(CallState::Missed),
            CallStatus::Ringing | CallStatus::Ongoing => None,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SUMMARY & EVENTS
// ============================================================================

/// Ergebnis von `start_call`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHandle {
    pub call_id: String,
    pub peer_id: String,
    pub is_video: bool,
}

/// Momentaufnahme des aktiven Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub peer_id: String,
    pub role: CallRole,
    pub is_video: bool,
    pub muted: bool,
    pub speakerphone: bool,
    /// Gesprächsdauer, sobald der Anruf beendet ist
    pub duration_secs: Option<u64>,
}

/// Ein Zustandsübergang, wie er an die UI geht
#[derive(Debug, Clone, PartialEq)]
pub struct CallStateChanged {
    pub previous: CallState,
    pub current: CallState,
    pub call: Option<CallSummary>,
    pub error: Option<CallError>,
}
