//! Session Module - Zustandsmaschine eines Anrufs
//!
//! Dieses Modul enthält:
//! - den CallSessionCoordinator (öffentliche API) und seinen Actor
//! - Call States und Events für die UI
//! - Ring Timeout, Join-Recovery und Audio-Health-Check
//!

mod actor;
mod audio_health;
mod coordinator;
mod error;
mod recovery;
mod state;
mod timer;

pub use audio_health::AudioHealthConfig;
pub use coordinator::{CallSessionCoordinator, Collaborators};
pub use error::CallError;
pub use recovery::{JoinFailure, JoinOutcome, RecoveryPolicy};
pub use state::{CallHandle, CallRole, CallState, CallStateChanged, CallSummary};
pub use timer::RingTimeoutTimer;
