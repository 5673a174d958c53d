//! Message Types für das Signaling-Protokoll
//!
//! JSON über WebSocket. Jeder Client-Request trägt `requestId`,
//! `timestamp` und `signature`; der Server antwortet mit `ack` oder
//! `error` (gleiche `requestId`) und pusht Record-Änderungen als `record`.

use super::record::{CallStatus, RecordUpdate, SignalingRecord};
use super::store::StoreError;
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Muss der erste Request auf einer Verbindung sein
    Authenticate {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    CreateRecord { record: SignalingRecord },

    UpdateRecord {
        #[serde(rename = "callId")]
        call_id: String,
        update: RecordUpdate,
    },

    GetRecord {
        #[serde(rename = "callId")]
        call_id: String,
    },

    /// Push aller Änderungen eines Records
    Subscribe {
        #[serde(rename = "callId")]
        call_id: String,
    },

    /// Push aller klingelnden Records mit `receiverId = userId`
    SubscribeIncoming {
        #[serde(rename = "userId")]
        user_id: String,
    },

    Heartbeat {},
}

/// Request mit Umschlag, so wie er über die Leitung geht
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRequest {
    #[serde(flatten)]
    pub request: ClientRequest,
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub timestamp: i64,
    pub signature: String,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Erfolgreiche Antwort auf einen Request
    Ack {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record: Option<SignalingRecord>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        records: Vec<SignalingRecord>,
    },

    /// Push: aktueller Stand eines abonnierten Records
    Record { record: SignalingRecord },

    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: u16,
        message: String,
        #[serde(rename = "callId", default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<CallStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested: Option<CallStatus>,
    },

    /// Heartbeat Antwort
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

// ============================================================================
// ERROR CODES
// ============================================================================

pub const CODE_UNAUTHENTICATED: u16 = 401;
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_CONFLICT: u16 = 409;
pub const CODE_UNAVAILABLE: u16 = 503;

/// Übersetzt einen Server-Fehler in einen [`StoreError`]
pub fn store_error_from_wire(
    code: u16,
    message: String,
    call_id: Option<String>,
    current: Option<CallStatus>,
    requested: Option<CallStatus>,
) -> StoreError {
    match code {
        CODE_UNAUTHENTICATED => StoreError::Unauthenticated,
        CODE_NOT_FOUND => StoreError::NotFound(call_id.unwrap_or(message)),
        CODE_CONFLICT => match (current, requested) {
            (Some(current), Some(requested)) => StoreError::InvalidTransition {
                call_id: call_id.unwrap_or_default(),
                current,
                requested,
            },
            _ => StoreError::AlreadyExists(call_id.unwrap_or(message)),
        },
        CODE_UNAVAILABLE => StoreError::Unavailable(message),
        other => StoreError::Backend(format!("{}: {}", other, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signed_request_layout() {
        let request = SignedRequest {
            request: ClientRequest::UpdateRecord {
                call_id: "c1".into(),
                update: RecordUpdate::missed("bob"),
            },
            request_id: 7,
            timestamp: 1_700_000_000_000,
            signature: "sig".into(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "update_record",
                "callId": "c1",
                "update": { "status": "missed", "missedBy": "bob" },
                "requestId": 7,
                "timestamp": 1_700_000_000_000i64,
                "signature": "sig"
            })
        );

        let heartbeat = serde_json::to_value(ClientRequest::Heartbeat {}).unwrap();
        assert_eq!(heartbeat, json!({ "type": "heartbeat" }));
    }

    #[test]
    fn test_parse_conflict_error() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": "error",
            "requestId": 3,
            "code": 409,
            "message": "invalid transition",
            "callId": "c1",
            "current": "ongoing",
            "requested": "missed"
        }))
        .unwrap();

        let ServerMessage::Error {
            request_id,
            code,
            message,
            call_id,
            current,
            requested,
        } = msg
        else {
            panic!("expected error");
        };
        assert_eq!(request_id, Some(3));
        assert_eq!(
            store_error_from_wire(code, message, call_id, current, requested),
            StoreError::InvalidTransition {
                call_id: "c1".into(),
                current: CallStatus::Ongoing,
                requested: CallStatus::Missed,
            }
        );
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            store_error_from_wire(401, "bad signature".into(), None, None, None),
            StoreError::Unauthenticated
        );
        assert_eq!(
            store_error_from_wire(404, "no such call".into(), Some("c9".into()), None, None),
            StoreError::NotFound("c9".into())
        );
        assert_eq!(
            store_error_from_wire(409, "exists".into(), Some("c1".into()), None, None),
            StoreError::AlreadyExists("c1".into())
        );
        assert!(store_error_from_wire(503, "busy".into(), None, None, None).is_transient());
        assert_eq!(
            store_error_from_wire(500, "boom".into(), None, None, None),
            StoreError::Backend("500: boom".into())
        );
    }

    #[test]
    fn test_pong_without_timestamp() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Pong { timestamp: None });
    }
}
