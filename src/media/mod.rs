//! Media Module - Schnittstelle zur Media Transport Engine
//!
//! Die eigentliche Engine (Audio/Video, NAT-Traversal, Codecs) ist ein
//! externer Kollaborateur. Dieses Modul definiert nur:
//! - den Adapter-Trait, über den der Coordinator sie steuert
//! - die Events, die sie zurückmeldet
//! - Channel- und Audio-Konfiguration

mod adapter;

pub use adapter::{
    AudioProfile, ChannelOptions, EngineConfig, EngineEvent, MediaEngineAdapter, MediaError,
    PeerLeftReason,
};
