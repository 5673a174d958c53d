//! Call Session - Koordination von Zwei-Personen-Anrufen
//!
//! Steuert den Lebenszyklus eines Sprach- oder Videoanrufs:
//! - Signaling Store (Cloudflare Worker) als gemeinsamer Anrufzustand
//! - externe Media Engine für Audio/Video
//! - Ed25519 Authentifizierung gegenüber dem Store
//! - SQLite für das lokale Anrufprotokoll
//!
//! ## Verwendung
//! ```no_run
//! use call_session::{CallSessionCoordinator, Collaborators, CoordinatorConfig};
//!
//! # async fn run(collaborators: Collaborators) -> anyhow::Result<()> {
//! call_session::init_tracing();
//!
//! let coordinator =
//!     CallSessionCoordinator::spawn("alice", CoordinatorConfig::load()?, collaborators)?;
//! let call = coordinator.start_call("bob", false).await?;
//! tracing::info!("Calling {} ({})", call.peer_id, call.call_id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod database;
pub mod media;
pub mod platform;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, CoordinatorConfig, SignalingConfig};
pub use crypto::KeyPair;
pub use database::{CallLog, CallLogRecorder};
pub use media::{EngineEvent, MediaEngineAdapter, MediaError};
pub use platform::{CallInfo, CallUi, PermissionGate};
pub use session::{
    CallError, CallHandle, CallRole, CallSessionCoordinator, CallState, CallStateChanged,
    CallSummary, Collaborators,
};
pub use signaling::{
    CallStatus, MemorySignalingStore, RemoteSignalingStore, SignalingRecord, SignalingStore,
    StoreError,
};

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den globalen tracing Subscriber
///
/// `RUST_LOG` hat Vorrang, sonst `call_session=debug`. Ein zweiter Aufruf
/// (oder ein bereits installierter Subscriber) wird ignoriert.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        if let Ok(directive) = "call_session=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Tracing initialized");
    }
}
