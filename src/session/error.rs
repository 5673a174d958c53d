use crate::signaling::StoreError;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Microphone/camera permission denied")]
    PermissionDenied,

    #[error("Media engine failed to initialize: {0}")]
    EngineInitFailed(String),

    #[error("Failed to join media channel after {attempts} attempt(s): {reason}")]
    MediaJoinFailed { attempts: u32, reason: String },

    #[error("Call record not found or no longer ringing: {0}")]
    RecordNotFound(String),

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    #[error("Signaling store error: {0}")]
    Signaling(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Call coordinator is shut down")]
    Shutdown,
}

impl From<StoreError> for CallError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(call_id) => CallError::RecordNotFound(call_id),
            StoreError::Unauthenticated => CallError::Unauthenticated,
            other => CallError::Signaling(other),
        }
    }
}
