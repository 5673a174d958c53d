//! Plattform-Kollaborateure: Anruf-UI und Berechtigungen
//!
//! Für den Coordinator sind beide undurchsichtig. Die native
//! Anrufoberfläche wird nur angezeigt und wieder geschlossen.

use crate::session::CallRole;
use async_trait::async_trait;
use serde::Serialize;

/// Daten die der Anrufbildschirm bekommt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub call_id: String,
    pub peer_id: String,
    pub is_video: bool,
    pub role: CallRole,
}

/// Native Anruf-Oberfläche (Klingelbildschirm / laufender Anruf)
#[async_trait]
pub trait CallUi: Send + Sync {
    async fn show(&self, info: &CallInfo);
    async fn dismiss(&self);
}

/// Mikrofon-/Kamera-Berechtigungen
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Fragt Mikrofon (und bei Video Kamera) an; `false` wenn verweigert
    async fn request_permissions(&self, needs_video: bool) -> bool;
}
