//! Signaling Record - der gemeinsame Zustand eines Anrufs
//!
//! Ein Record existiert genau einmal pro Anruf und wird über den
//! Signaling Store zwischen Anrufer und Angerufenem repliziert.
//! Der Status darf nur vorwärts laufen:
//!
//! ```text
//! ringing ─┬─> ongoing ──> ended
//!          ├─> declined
//!          └─> missed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CALL STATUS
// ============================================================================

/// Status eines Anrufs wie er im Signaling Store steht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Ongoing,
    Ended,
    Declined,
    Missed,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Ongoing => "ongoing",
            CallStatus::Ended => "ended",
            CallStatus::Declined => "declined",
            CallStatus::Missed => "missed",
        }
    }

    /// Endzustände können nicht mehr verlassen werden
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Declined | CallStatus::Missed
        )
    }

    /// Prüft ob `self -> next` eine gültige Kante ist
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (CallStatus::Ringing, CallStatus::Ongoing)
                | (CallStatus::Ringing, CallStatus::Declined)
                | (CallStatus::Ringing, CallStatus::Missed)
                | (CallStatus::Ongoing, CallStatus::Ended)
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SIGNALING RECORD
// ============================================================================

/// Kanonische Repräsentation eines Anrufs
///
/// `call_id` ist gleichzeitig der Name des Media-Channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingRecord {
    pub call_id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub is_video: bool,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    /// Gesprächsdauer in Sekunden, gesetzt beim Übergang nach ended/declined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Wer den Anruf verpasst hat (nur bei missed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missed_by: Option<String>,
}

impl SignalingRecord {
    /// Erstellt einen neuen Record für einen ausgehenden Anruf
    pub fn new_outgoing(caller_id: &str, receiver_id: &str, is_video: bool) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            caller_id: caller_id.to_string(),
            receiver_id: receiver_id.to_string(),
            is_video,
            status: CallStatus::Ringing,
            created_at: Utc::now(),
            duration: None,
            missed_by: None,
        }
    }

    /// Gibt die Gegenseite aus Sicht von `user_id` zurück
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    /// Wendet eine Änderung an, falls die Statuskante gültig ist
    ///
    /// Gibt `false` zurück und lässt den Record unverändert, wenn nicht.
    pub fn apply(&mut self, update: &RecordUpdate) -> bool {
        if !self.status.can_transition_to(update.status) {
            return false;
        }

        self.status = update.status;
        if update.duration.is_some() {
            self.duration = update.duration;
        }
        if update.missed_by.is_some() {
            self.missed_by = update.missed_by.clone();
        }
        true
    }
}

// ============================================================================
// RECORD UPDATE
// ============================================================================

/// Feldänderungen an einem bestehenden Record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missed_by: Option<String>,
}

impl RecordUpdate {
    /// Angerufener hat angenommen
    pub fn answered() -> Self {
        Self {
            status: CallStatus::Ongoing,
            duration: None,
            missed_by: None,
        }
    }

    pub fn ended(duration_secs: u64) -> Self {
        Self {
            status: CallStatus::Ended,
            duration: Some(duration_secs),
            missed_by: None,
        }
    }

    pub fn declined() -> Self {
        Self {
            status: CallStatus::Declined,
            duration: Some(0),
            missed_by: None,
        }
    }

    pub fn missed(missed_by: &str) -> Self {
        Self {
            status: CallStatus::Missed,
            duration: None,
            missed_by: Some(missed_by.to_string()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_edges() {
        use CallStatus::*;

        assert!(Ringing.can_transition_to(Ongoing));
        assert!(Ringing.can_transition_to(Declined));
        assert!(Ringing.can_transition_to(Missed));
        assert!(Ongoing.can_transition_to(Ended));

        assert!(!Ringing.can_transition_to(Ended));
        assert!(!Ongoing.can_transition_to(Missed));
        assert!(!Ended.can_transition_to(Ringing));
        assert!(!Missed.can_transition_to(Ongoing));
        assert!(!Ongoing.can_transition_to(Ongoing));
    }

    #[test]
    fn test_apply_rejects_stale_update() {
        let mut record = SignalingRecord::new_outgoing("alice", "bob", false);
        assert!(record.apply(&RecordUpdate::answered()));
        assert!(record.apply(&RecordUpdate::ended(42)));

        // Ein verspätetes "missed" darf nichts mehr ändern
        assert!(!record.apply(&RecordUpdate::missed("bob")));
        assert_eq!(record.status, CallStatus::Ended);
        assert_eq!(record.duration, Some(42));
        assert_eq!(record.missed_by, None);
    }

    #[test]
    fn test_record_json_layout() {
        let mut record = SignalingRecord::new_outgoing("alice", "bob", true);
        record.apply(&RecordUpdate::missed("bob"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["callerId"], "alice");
        assert_eq!(json["receiverId"], "bob");
        assert_eq!(json["isVideo"], true);
        assert_eq!(json["status"], "missed");
        assert_eq!(json["missedBy"], "bob");
        assert!(json.get("duration").is_none());

        let parsed: SignalingRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_peer_of() {
        let record = SignalingRecord::new_outgoing("alice", "bob", false);
        assert_eq!(record.peer_of("alice"), "bob");
        assert_eq!(record.peer_of("bob"), "alice");
    }
}
