//! Call Session Coordinator
//!
//! Öffentliche Schnittstelle zum Call Actor. Der Coordinator selbst hält
//! keinen veränderlichen Zustand: jede Aktion wird als Nachricht an den
//! Actor geschickt, die Antwort kommt über einen oneshot-Kanal zurück.
//! `state()` und `active_call()` lesen einen Snapshot, den der Actor nach
//! jedem Übergang aktualisiert.

use super::actor::{CallActor, Input, Mailbox, SessionSnapshot};
use super::error::CallError;
use super::state::{CallHandle, CallState, CallStateChanged, CallSummary};
use crate::config::{ConfigError, CoordinatorConfig};
use crate::media::MediaEngineAdapter;
use crate::platform::{CallUi, PermissionGate};
use crate::signaling::{receiver_stream, SignalingStore};
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Kapazität des Event-Kanals für die UI
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Externe Kollaborateure des Coordinators
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn SignalingStore>,
    pub engine: Arc<dyn MediaEngineAdapter>,
    pub ui: Arc<dyn CallUi>,
    pub permissions: Arc<dyn PermissionGate>,
}

/// Handle auf den (einzigen) Call Actor dieses Prozesses
#[derive(Clone)]
pub struct CallSessionCoordinator {
    self_id: Arc<str>,
    tx: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<CallStateChanged>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl CallSessionCoordinator {
    /// Startet den Actor für `self_id`
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden. Eine ungültige
    /// Konfiguration wird abgelehnt bevor der Actor startet.
    pub fn spawn(
        self_id: &str,
        config: CoordinatorConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let snapshot = Arc::new(RwLock::new(SessionSnapshot::default()));

        // Vor dem ersten Join abonnieren, sonst gehen Events verloren
        let engine_events = collaborators.engine.events();

        let actor = CallActor::new(
            self_id.to_string(),
            config,
            collaborators.store,
            collaborators.engine,
            collaborators.ui,
            collaborators.permissions,
            Mailbox::new(&tx),
            events.clone(),
            snapshot.clone(),
        );
        tokio::spawn(actor.run(rx, engine_events));

        Ok(Self {
            self_id: Arc::from(self_id),
            tx,
            events,
            snapshot,
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Ruft `peer_id` an
    ///
    /// Kehrt zurück sobald der Record angelegt ist und es klingelt. Ob der
    /// Anruf zustande kommt, zeigen die [`CallStateChanged`] Events.
    pub async fn start_call(&self, peer_id: &str, is_video: bool) -> Result<CallHandle, CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Input::StartCall {
                peer_id: peer_id.to_string(),
                is_video,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Nimmt den eingehenden Anruf `call_id` an
    pub async fn answer_call(&self, call_id: &str) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Input::AnswerCall {
                call_id: call_id.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Legt auf bzw. lehnt ab (`declined`); no-op ohne aktiven Anruf
    pub async fn end_call(&self, declined: bool) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(Input::EndCall { declined, reply }, rx).await;
    }

    /// Gibt den neuen Mute-Status zurück
    pub async fn toggle_mute(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.request(Input::ToggleMute { reply }, rx)
            .await
            .unwrap_or(false)
    }

    /// Gibt den neuen Lautsprecher-Status zurück
    pub async fn toggle_speaker(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.request(Input::ToggleSpeaker { reply }, rx)
            .await
            .unwrap_or(false)
    }

    /// Stream aller Zustandsübergänge ab jetzt
    pub fn call_state_events(&self) -> BoxStream<'static, CallStateChanged> {
        receiver_stream(self.events.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallStateChanged> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.read().state
    }

    pub fn active_call(&self) -> Option<CallSummary> {
        self.snapshot.read().call.clone()
    }

    /// Beendet einen laufenden Anruf und stoppt den Actor
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(Input::Shutdown { reply }, rx).await.is_ok() {
            tracing::info!("Call session coordinator for {} shut down", self.self_id);
        }
    }

    async fn request<T>(&self, input: Input, rx: oneshot::Receiver<T>) -> Result<T, CallError> {
        self.tx.send(input).map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)
    }

    /// Schiebt eine Eingabe direkt in die Queue (Rennen nachstellen)
    #[cfg(test)]
    pub(crate) fn inject(&self, input: Input) {
        let _ = self.tx.send(input);
    }
}

// ============================================================================
// TESTS
// ============================================================================
