//! Ed25519 Identität für Requests an den Signaling Store
//!
//! Jeder Request an den Server trägt einen Timestamp und eine Signatur
//! über den kanonischen JSON-Body. Der Private Key liegt Base64-kodiert im
//! Datenverzeichnis der App.
//!
//! ## Verwendung
//! ```no_run
//! use call_session::crypto::KeyPair;
//!
//! let keypair = KeyPair::load_or_create(&KeyPair::default_path()?)?;
//! let body = serde_json::json!({ "type": "get_record", "callId": "c1" });
//! let signature = keypair.sign_request(&body);
//! # Ok::<(), call_session::crypto::KeyPairError>(())
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Feld, das bei der Signatur ausgelassen wird
pub const SIGNATURE_FIELD: &str = "signature";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode key: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Could not determine app data directory")]
    NoDataDir,
}

// ============================================================================
// KEYPAIR STRUCT
// ============================================================================

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt das Schlüsselpaar aus `path` oder legt dort ein neues an
    pub fn load_or_create(path: &Path) -> Result<Self, KeyPairError> {
        if path.exists() {
            tracing::info!("Loading existing keypair from {:?}", path);
            Self::load_from_file(path)
        } else {
            tracing::info!("Creating new keypair at {:?}", path);
            let keypair = Self::generate();
            keypair.save_to_file(path)?;
            Ok(keypair)
        }
    }

    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Standard-Pfad der Key-Datei
    ///
    /// - Windows: `%APPDATA%/pulse/call-session/data/keys/private.key`
    /// - macOS: `~/Library/Application Support/com.pulse.call-session/keys/private.key`
    /// - Linux: `~/.local/share/call-session/keys/private.key`
    pub fn default_path() -> Result<PathBuf, KeyPairError> {
        let proj_dirs = directories::ProjectDirs::from("com", "pulse", "call-session")
            .ok_or(KeyPairError::NoDataDir)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("keys");
        path.push("private.key");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyPairError::InvalidKeyLength(bytes.len()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600); // Nur Owner kann lesen/schreiben
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signiert einen Request-Body
    ///
    /// Die Signatur läuft über den JSON-String mit alphabetisch sortierten
    /// Keys, ohne das `signature` Feld selbst.
    pub fn sign_request(&self, body: &Value) -> String {
        let signature = self.sign(canonical_json(body).as_bytes());
        BASE64.encode(signature.to_bytes())
    }
}

/// Prüft die Signatur eines Request-Bodys gegen einen Base64 Public Key
pub fn verify_request(public_key_base64: &str, body: &Value) -> bool {
    let Some(signature) = body.get(SIGNATURE_FIELD).and_then(Value::as_str) else {
        return false;
    };

    let key = BASE64
        .decode(public_key_base64)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
        .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok());
    let signature = BASE64
        .decode(signature)
        .ok()
        .and_then(|bytes| Signature::from_slice(&bytes).ok());

    match (key, signature) {
        (Some(key), Some(signature)) => key
            .verify(canonical_json(body).as_bytes(), &signature)
            .is_ok(),
        _ => false,
    }
}

fn canonical_json(body: &Value) -> String {
    sorted_without_signature(body).to_string()
}

fn sorted_without_signature(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().filter(|k| *k != SIGNATURE_FIELD).collect();
            keys.sort();

            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sorted_without_signature(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_without_signature).collect()),
        other => other.clone(),
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
