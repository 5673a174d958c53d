//! Signaling Module - gemeinsamer Anrufzustand über den Signaling Store
//!
//! Dieses Modul verwaltet:
//! - den SignalingRecord und seine erlaubten Statusübergänge
//! - den Store-Trait (create/update/get/subscribe)
//! - einen In-Process Store und einen WebSocket-Client für den Server
//!

mod client;
mod memory;
mod messages;
mod record;
mod store;

pub use client::RemoteSignalingStore;
pub use memory::MemorySignalingStore;
pub use messages::*;
pub use record::{CallStatus, RecordUpdate, SignalingRecord};
pub use store::{receiver_stream, RecordStream, SignalingStore, StoreError};
