//! Crypto Module - Ed25519 Identität
//!
//! Dieses Modul verwaltet die kryptographische Identität des Benutzers:
//! - Generierung eines Ed25519 Schlüsselpaars beim ersten Start
//! - Persistente Speicherung des Private Keys
//! - Signierung und Prüfung von Requests an den Signaling Store
//!

mod keypair;

pub use keypair::{verify_request, KeyPair, KeyPairError, SIGNATURE_FIELD};
