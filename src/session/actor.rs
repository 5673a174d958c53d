//! Call Actor - der einzige Schreiber der Zustandsmaschine
//!
//! Benutzeraktionen, Record-Snapshots aus dem Signaling Store, Engine-Events,
//! Timer und fertige Hintergrund-Tasks landen alle in derselben Queue und
//! werden strikt nacheinander abgearbeitet. Netzwerk-Operationen mit
//! unbegrenzter Dauer (Join mit Retries, terminale Store-Writes, Audio-Reset)
//! laufen als eigene Tasks und melden sich über die Queue zurück.

use super::audio_health::{reset_local_audio, AudioHealthMonitor};
use super::error::CallError;
use super::recovery::{JoinFailure, JoinOutcome};
use super::state::{CallHandle, CallRole, CallState, CallStateChanged, CallSummary};
use super::timer::RingTimeoutTimer;
use crate::config::CoordinatorConfig;
use crate::media::{AudioProfile, ChannelOptions, EngineEvent, MediaEngineAdapter, PeerLeftReason};
use crate::platform::{CallInfo, CallUi, PermissionGate};
use crate::signaling::{
    CallStatus, RecordStream, RecordUpdate, SignalingRecord, SignalingStore, StoreError,
};
use anyhow::Context;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Wie viele eingehende call_ids wir uns merken
const SEEN_CALLS_CAPACITY: usize = 64;

// ============================================================================
// INPUTS
// ============================================================================

/// Alles was die Zustandsmaschine bewegt
#[derive(Debug)]
pub(crate) enum Input {
    StartCall {
        peer_id: String,
        is_video: bool,
        reply: oneshot::Sender<Result<CallHandle, CallError>>,
    },
    AnswerCall {
        call_id: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    EndCall {
        declined: bool,
        reply: oneshot::Sender<()>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleSpeaker {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// Snapshot des Records des aktiven Anrufs
    Record(SignalingRecord),
    /// Klingelnder Record für uns
    Incoming(SignalingRecord),
    Engine(EngineEvent),
    RingTimeout {
        call_id: String,
    },
    JoinFinished {
        call_id: String,
        result: Result<JoinOutcome, JoinFailure>,
    },
    AudioResetFinished {
        call_id: String,
        succeeded: bool,
    },
    Linger {
        call_id: String,
    },
    /// Record-Subscription des Anrufs ist abgerissen
    SubscriptionClosed {
        call_id: String,
    },
}

/// Schwacher Rückkanal in die eigene Queue
///
/// Hält den Actor nicht am Leben: sind alle Coordinator-Handles weg,
/// endet die Schleife.
#[derive(Clone)]
pub(crate) struct Mailbox(mpsc::WeakUnboundedSender<Input>);

impl Mailbox {
    pub fn new(tx: &mpsc::UnboundedSender<Input>) -> Self {
        Self(tx.downgrade())
    }

    pub fn send(&self, input: Input) -> bool {
        match self.0.upgrade() {
            Some(tx) => tx.send(input).is_ok(),
            None => false,
        }
    }
}

/// Leitet einen Stream in die Queue weiter
///
/// Endet der Stream von selbst, wird `on_end` (falls gesetzt) nachgeschickt.
fn forward<T, F>(
    mailbox: Mailbox,
    mut stream: BoxStream<'static, T>,
    wrap: F,
    on_end: Option<Input>,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Input + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            if !mailbox.send(wrap(item)) {
                return;
            }
        }
        if let Some(input) = on_end {
            mailbox.send(input);
        }
    })
}

/// Was `state()` und `active_call()` lesen
#[derive(Debug, Clone)]
pub(crate) struct SessionSnapshot {
    pub state: CallState,
    pub call: Option<CallSummary>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            call: None,
        }
    }
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

struct ActiveCall {
    record: SignalingRecord,
    role: CallRole,
    peer_id: String,
    timer: Option<RingTimeoutTimer>,
    join_task: Option<JoinHandle<()>>,
    audio_reset_task: Option<JoinHandle<()>>,
    linger_task: Option<JoinHandle<()>>,
    subscription: Option<JoinHandle<()>>,
    joined: bool,
    channel_left: bool,
    ui_visible: bool,
    connected_at: Option<Instant>,
    muted: bool,
    speakerphone: bool,
    audio: AudioHealthMonitor,
    duration_secs: Option<u64>,
}

impl ActiveCall {
    fn new(record: SignalingRecord, role: CallRole, self_id: &str) -> Self {
        let peer_id = record.peer_of(self_id).to_string();
        Self {
            record,
            role,
            peer_id,
            timer: None,
            join_task: None,
            audio_reset_task: None,
            linger_task: None,
            subscription: None,
            joined: false,
            channel_left: false,
            ui_visible: false,
            connected_at: None,
            muted: false,
            speakerphone: false,
            audio: AudioHealthMonitor::default(),
            duration_secs: None,
        }
    }

    fn call_id(&self) -> &str {
        &self.record.call_id
    }

    fn talk_secs(&self) -> u64 {
        self.connected_at
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Welcher Status-Write einen noch laufenden Anruf beendet
    ///
    /// `ringing -> ended` ist keine gültige Kante: wer vor dem Annehmen
    /// auflegt, schreibt `missed` (Anrufer) bzw. `declined` (Angerufener).
    fn terminal_update(&self, declined: bool) -> Option<RecordUpdate> {
        match self.record.status {
            CallStatus::Ringing if declined => Some(RecordUpdate::declined()),
            CallStatus::Ringing => match self.role {
                CallRole::Caller => Some(RecordUpdate::missed(&self.record.receiver_id)),
                CallRole::Receiver => Some(RecordUpdate::declined()),
            },
            CallStatus::Ongoing => Some(RecordUpdate::ended(self.talk_secs())),
            _ => None,
        }
    }

    /// Bricht alles ab was noch für diesen Anruf läuft (außer dem Linger)
    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        for task in [
            self.join_task.take(),
            self.audio_reset_task.take(),
            self.subscription.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }

    fn summary(&self) -> CallSummary {
        CallSummary {
            call_id: self.record.call_id.clone(),
            peer_id: self.peer_id.clone(),
            role: self.role,
            is_video: self.record.is_video,
            muted: self.muted,
            speakerphone: self.speakerphone,
            duration_secs: self.duration_secs,
        }
    }

    fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.record.call_id.clone(),
            peer_id: self.peer_id.clone(),
            is_video: self.record.is_video,
            role: self.role,
        }
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.cancel_tasks();
        if let Some(task) = self.linger_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// CALL ACTOR
// ============================================================================

pub(crate) struct CallActor {
    self_id: String,
    config: CoordinatorConfig,
    store: Arc<dyn SignalingStore>,
    engine: Arc<dyn MediaEngineAdapter>,
    ui: Arc<dyn CallUi>,
    permissions: Arc<dyn PermissionGate>,
    mailbox: Mailbox,
    events: broadcast::Sender<CallStateChanged>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    state: CallState,
    active: Option<ActiveCall>,
    engine_ready: bool,
    seen_calls: HashSet<String>,
    seen_order: VecDeque<String>,
    forwarders: Vec<JoinHandle<()>>,
}

impl CallActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: String,
        config: CoordinatorConfig,
        store: Arc<dyn SignalingStore>,
        engine: Arc<dyn MediaEngineAdapter>,
        ui: Arc<dyn CallUi>,
        permissions: Arc<dyn PermissionGate>,
        mailbox: Mailbox,
        events: broadcast::Sender<CallStateChanged>,
        snapshot: Arc<RwLock<SessionSnapshot>>,
    ) -> Self {
        Self {
            self_id,
            config,
            store,
            engine,
            ui,
            permissions,
            mailbox,
            events,
            snapshot,
            state: CallState::Idle,
            active: None,
            engine_ready: false,
            seen_calls: HashSet::new(),
            seen_order: VecDeque::new(),
            forwarders: Vec::new(),
        }
    }

    /// Hauptschleife; endet bei `Shutdown` oder wenn alle Handles weg sind
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        engine_events: BoxStream<'static, EngineEvent>,
    ) {
        tracing::info!("Call session actor started for {}", self.self_id);

        self.forwarders
            .push(forward(
            self.mailbox.clone(),
            engine_events,
            Input::Engine,
            None,
        ));

        match self.store.subscribe_incoming(&self.self_id).await {
            Ok(incoming) => {
                self.forwarders.push(forward(
                    self.mailbox.clone(),
                    incoming,
                    Input::Incoming,
                    None,
                ));
            }
            Err(e) => {
                tracing::error!("Failed to subscribe to incoming calls: {}", e);
            }
        }

        let mut health = tokio::time::interval(self.config.audio_health.check_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                input = inputs.recv() => {
                    let Some(input) = input else {
                        tracing::debug!("All coordinator handles dropped");
                        break;
                    };
                    if self.handle(input).await.is_break() {
                        break;
                    }
                }
                _ = health.tick() => self.check_audio_health(),
            }
        }

        self.end_locally(false).await;
        for task in self.forwarders.drain(..) {
            task.abort();
        }
        tracing::info!("Call session actor stopped for {}", self.self_id);
    }

    async fn handle(&mut self, input: Input) -> ControlFlow<()> {
        match input {
            Input::StartCall {
                peer_id,
                is_video,
                reply,
            } => {
                let result = self.start_call(&peer_id, is_video).await;
                if let Err(e) = &result {
                    tracing::warn!("Failed to start call to {}: {}", peer_id, e);
                }
                let _ = reply.send(result);
            }
            Input::AnswerCall { call_id, reply } => {
                let result = self.answer_call(&call_id).await;
                if let Err(e) = &result {
                    tracing::warn!("Failed to answer call {}: {}", call_id, e);
                }
                let _ = reply.send(result);
            }
            Input::EndCall { declined, reply } => {
                self.end_locally(declined).await;
                let _ = reply.send(());
            }
            Input::ToggleMute { reply } => {
                let muted = self.toggle_mute().await;
                let _ = reply.send(muted);
            }
            Input::ToggleSpeaker { reply } => {
                let enabled = self.toggle_speaker().await;
                let _ = reply.send(enabled);
            }
            Input::Shutdown { reply } => {
                self.end_locally(false).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
            Input::Record(record) => self.on_record(record).await,
            Input::Incoming(record) => self.on_incoming(record).await,
            Input::Engine(event) => {
                // Fehler und Panics im Event-Handler dürfen die Schleife nicht beenden
                let outcome = AssertUnwindSafe(self.on_engine_event(event))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!("Engine event handling failed: {:#}", e);
                        self.fail_call(CallError::Internal(format!("{:#}", e))).await;
                    }
                    Err(_) => {
                        tracing::error!("Engine event handler panicked");
                        self.fail_call(CallError::Internal(
                            "engine event handler panicked".into(),
                        ))
                        .await;
                    }
                }
            }
            Input::RingTimeout { call_id } => self.on_ring_timeout(&call_id).await,
            Input::JoinFinished { call_id, result } => {
                self.on_join_finished(&call_id, result).await
            }
            Input::AudioResetFinished { call_id, succeeded } => {
                self.on_audio_reset_finished(&call_id, succeeded)
            }
            Input::Linger { call_id } => self.on_linger(&call_id),
            Input::SubscriptionClosed { call_id } => self.on_subscription_closed(&call_id).await,
        }
        ControlFlow::Continue(())
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    async fn start_call(&mut self, peer_id: &str, is_video: bool) -> Result<CallHandle, CallError> {
        if peer_id.is_empty() || peer_id == self.self_id {
            return Err(CallError::InvalidPeer(peer_id.to_string()));
        }

        self.replace_active_call().await;

        if !self.permissions.request_permissions(is_video).await {
            return Err(CallError::PermissionDenied);
        }
        self.ensure_engine().await?;
        self.configure_profile(is_video).await;

        let record = SignalingRecord::new_outgoing(&self.self_id, peer_id, is_video);
        let call_id = record.call_id.clone();

        // Erst abonnieren, dann anlegen: der ringing-Snapshot kommt so garantiert an
        let updates = self.store.subscribe(&call_id).await?;
        self.store.create(record.clone()).await?;
        tracing::info!(
            "Outgoing {} call {} to {}",
            if is_video { "video" } else { "voice" },
            call_id,
            peer_id
        );

        let mut active = ActiveCall::new(record, CallRole::Caller, &self.self_id);
        active.subscription = Some(self.forward_record(&call_id, updates));
        active.timer = Some(self.arm_timer(&call_id, self.config.ring_timeout()));
        // Vorab beitreten; Ongoing gibt es trotzdem erst mit der Antwort
        active.join_task = Some(self.spawn_join(&call_id, is_video));
        self.ui.show(&active.info()).await;
        active.ui_visible = true;
        self.active = Some(active);

        self.transition(CallState::OutgoingRinging, None);

        Ok(CallHandle {
            call_id,
            peer_id: peer_id.to_string(),
            is_video,
        })
    }

    async fn answer_call(&mut self, call_id: &str) -> Result<(), CallError> {
        let is_current = self
            .active
            .as_ref()
            .map(|active| active.call_id() == call_id)
            .unwrap_or(false);

        if is_current {
            match self.state {
                CallState::IncomingRinging => {}
                CallState::Connecting | CallState::Ongoing => return Ok(()),
                _ => return Err(CallError::RecordNotFound(call_id.to_string())),
            }
        } else {
            // Anruf den wir (besetzt) ignoriert haben
            let record = self.store.get(call_id).await?;
            if record.receiver_id != self.self_id || record.status != CallStatus::Ringing {
                return Err(CallError::RecordNotFound(call_id.to_string()));
            }
            self.replace_active_call().await;
            self.adopt_incoming(record).await?;
        }

        let is_video = self
            .active
            .as_ref()
            .map(|active| active.record.is_video)
            .unwrap_or(false);

        if !self.permissions.request_permissions(is_video).await {
            return Err(CallError::PermissionDenied);
        }
        self.ensure_engine().await?;
        self.configure_profile(is_video).await;

        let store = self.store.clone();
        let updated = retry_once("answer", || store.update(call_id, RecordUpdate::answered()))
            .await
            .map_err(|e| match e {
                StoreError::InvalidTransition { .. } => {
                    CallError::RecordNotFound(call_id.to_string())
                }
                other => CallError::from(other),
            })?;

        let join_task = self.spawn_join(call_id, is_video);
        let Some(active) = self.active.as_mut() else {
            join_task.abort();
            return Err(CallError::RecordNotFound(call_id.to_string()));
        };
        if let Some(timer) = active.timer.take() {
            timer.cancel();
        }
        active.record = updated;
        active.join_task = Some(join_task);
        tracing::info!("Answered call {} from {}", call_id, active.peer_id);

        self.transition(CallState::Connecting, None);
        Ok(())
    }

    /// Lokales Auflegen; no-op ohne laufenden Anruf
    async fn end_locally(&mut self, declined: bool) {
        if !self.state.is_active() {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let update = active.terminal_update(declined);
        let call_id = active.call_id().to_string();
        let next = match &update {
            Some(update) if update.status == CallStatus::Declined => CallState::Declined,
            _ => CallState::Ended,
        };
        active.duration_secs = Some(update.as_ref().and_then(|u| u.duration).unwrap_or(0));
        tracing::info!("Ending call {} ({})", call_id, next);

        self.transition(CallState::Ending, None);
        self.teardown().await;
        if let Some(update) = update {
            self.publish_terminal(call_id, update);
        }
        self.transition(next, None);
    }

    async fn toggle_mute(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        let target = !active.muted;
        match self.engine.mute_local(target).await {
            Ok(()) => active.muted = target,
            Err(e) => tracing::warn!("Failed to set mute={}: {}", target, e),
        }
        let muted = active.muted;
        self.publish_snapshot();
        muted
    }

    async fn toggle_speaker(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        // Die Route kann sich durch das OS geändert haben (Headset, Bluetooth)
        match self.engine.speakerphone_enabled().await {
            Ok(current) => {
                let target = !current;
                match self.engine.set_speakerphone(target).await {
                    Ok(()) => active.speakerphone = target,
                    Err(e) => {
                        tracing::warn!("Failed to set speakerphone={}: {}", target, e);
                        active.speakerphone = current;
                    }
                }
            }
            Err(e) => tracing::warn!("Could not query audio route: {}", e),
        }
        let enabled = active.speakerphone;
        self.publish_snapshot();
        enabled
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn on_record(&mut self, record: SignalingRecord) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.call_id() != record.call_id {
            tracing::trace!("Ignoring record of previous call {}", record.call_id);
            return;
        }
        if !self.state.is_active() {
            return;
        }
        if record.status == active.record.status {
            return;
        }
        if !active.record.status.can_transition_to(record.status) {
            tracing::debug!(
                "Ignoring stale record for {}: {} -> {}",
                record.call_id,
                active.record.status,
                record.status
            );
            return;
        }

        tracing::debug!(
            "Record {} changed: {} -> {}",
            record.call_id,
            active.record.status,
            record.status
        );
        let status = record.status;
        active.record = record;

        match status {
            CallStatus::Ongoing => self.on_remote_answer(),
            status => {
                if let Some(next) = CallState::from_terminal_status(status) {
                    self.on_remote_terminal(next).await;
                }
            }
        }
    }

    fn on_remote_answer(&mut self) {
        if self.state != CallState::OutgoingRinging {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(timer) = active.timer.take() {
            timer.cancel();
        }
        let joined = active.joined;
        tracing::info!("Call {} answered by {}", active.call_id(), active.peer_id);

        self.transition(CallState::Connecting, None);
        if joined {
            self.enter_ongoing();
        }
    }

    async fn on_remote_terminal(&mut self, next: CallState) {
        if let Some(active) = self.active.as_mut() {
            let duration = active.record.duration.unwrap_or_else(|| active.talk_secs());
            active.duration_secs = Some(duration);
            tracing::info!("Call {} finished remotely ({})", active.call_id(), next);
        }
        self.teardown().await;
        self.transition(next, None);
    }

    /// Ohne Subscription erfahren wir nichts mehr von der Gegenseite
    async fn on_subscription_closed(&mut self, call_id: &str) {
        if !self.is_current(call_id) {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.subscription = None;
        }
        tracing::warn!("Record subscription for {} closed", call_id);
        self.fail_call(CallError::Signaling(StoreError::Unavailable(
            "record subscription closed".into(),
        )))
        .await;
    }

    async fn on_incoming(&mut self, record: SignalingRecord) {
        if record.receiver_id != self.self_id || record.status != CallStatus::Ringing {
            return;
        }
        if self.seen_calls.contains(&record.call_id) {
            return;
        }

        let age = (chrono::Utc::now() - record.created_at)
            .to_std()
            .unwrap_or_default();
        if age > self.config.incoming_ring_window() {
            tracing::debug!(
                "Ignoring stale incoming call {} ({}s old)",
                record.call_id,
                age.as_secs()
            );
            self.mark_seen(&record.call_id);
            return;
        }

        if self.state.is_active() {
            // Der Timer des Anrufers löst das auf
            tracing::info!(
                "Busy, ignoring incoming call {} from {}",
                record.call_id,
                record.caller_id
            );
            return;
        }

        let call_id = record.call_id.clone();
        self.replace_active_call().await;
        if let Err(e) = self.adopt_incoming(record).await {
            tracing::warn!("Could not follow incoming call {}: {}", call_id, e);
        }
    }

    /// Übernimmt einen klingelnden Record als aktiven Anruf
    async fn adopt_incoming(&mut self, record: SignalingRecord) -> Result<(), CallError> {
        let call_id = record.call_id.clone();
        let updates = self.store.subscribe(&call_id).await?;
        self.mark_seen(&call_id);

        let mut active = ActiveCall::new(record, CallRole::Receiver, &self.self_id);
        tracing::info!("Incoming call {} from {}", call_id, active.peer_id);
        active.subscription = Some(self.forward_record(&call_id, updates));
        active.timer = Some(self.arm_timer(&call_id, self.config.incoming_ring_window()));
        self.ui.show(&active.info()).await;
        active.ui_visible = true;
        self.active = Some(active);

        self.transition(CallState::IncomingRinging, None);
        Ok(())
    }

    async fn on_ring_timeout(&mut self, call_id: &str) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.call_id() != call_id {
            return;
        }
        // Record hat sich schon bewegt (Antwort kam zuerst): nichts tun
        let still_ringing = matches!(
            self.state,
            CallState::OutgoingRinging | CallState::IncomingRinging
        ) && active.record.status == CallStatus::Ringing;
        if !still_ringing {
            tracing::debug!("Ring timeout for {} ignored, call moved on", call_id);
            return;
        }

        active.timer = None;
        active.duration_secs = Some(0);
        let update = RecordUpdate::missed(&active.record.receiver_id);
        tracing::info!("Call {} not answered in time", call_id);

        self.teardown().await;
        self.publish_terminal(call_id.to_string(), update);
        self.transition(CallState::Missed, None);
    }

    // ========================================================================
    // MEDIA
    // ========================================================================

    async fn ensure_engine(&mut self) -> Result<(), CallError> {
        if self.engine_ready {
            return Ok(());
        }
        self.engine
            .initialize(&self.config.engine)
            .await
            .map_err(|e| CallError::EngineInitFailed(e.to_string()))?;
        self.engine_ready = true;
        tracing::info!("Media engine initialized");
        Ok(())
    }

    async fn configure_profile(&self, is_video: bool) {
        let profile = AudioProfile::for_call(is_video, self.config.engine.high_quality_audio);
        if let Err(e) = self.engine.configure_audio_profile(profile).await {
            tracing::warn!("Failed to configure audio profile {:?}: {}", profile, e);
        }
    }

    fn spawn_join(&self, call_id: &str, is_video: bool) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let policy = self.config.recovery;
        let mailbox = self.mailbox.clone();
        let call_id = call_id.to_string();
        let options = ChannelOptions::for_call(is_video);

        tokio::spawn(async move {
            let result = policy.join(engine.as_ref(), &call_id, &options).await;
            mailbox.send(Input::JoinFinished { call_id, result });
        })
    }

    async fn on_join_finished(
        &mut self,
        call_id: &str,
        result: Result<JoinOutcome, JoinFailure>,
    ) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.call_id() != call_id || !self.state.is_active() {
            tracing::debug!("Ignoring join result for finished call {}", call_id);
            return;
        }
        active.join_task = None;

        match result {
            Ok(outcome) => {
                tracing::debug!(
                    "Joined channel {} after {} attempt(s)",
                    call_id,
                    outcome.attempts
                );
                self.on_local_joined();
            }
            Err(failure) => {
                self.fail_call(CallError::MediaJoinFailed {
                    attempts: failure.attempts,
                    reason: failure.last_error.to_string(),
                })
                .await;
            }
        }
    }

    fn on_local_joined(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.joined {
            return;
        }
        active.joined = true;

        match self.state {
            CallState::Connecting => self.enter_ongoing(),
            CallState::OutgoingRinging => {
                tracing::debug!(
                    "Caller joined {} early, waiting for answer",
                    active.call_id()
                );
            }
            _ => {}
        }
    }

    fn enter_ongoing(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.connected_at = Some(Instant::now());
        }
        self.transition(CallState::Ongoing, None);
    }

    async fn on_engine_event(&mut self, event: EngineEvent) -> anyhow::Result<()> {
        match event {
            EngineEvent::LocalJoined { channel } => {
                if !self.is_current(&channel) {
                    tracing::trace!("Ignoring join event for channel {}", channel);
                    return Ok(());
                }
                let muted = self.active.as_ref().map(|a| a.muted).unwrap_or(false);
                if muted {
                    // Nach einem Rejoin publiziert die Engine wieder ungemutet
                    self.engine
                        .mute_local(true)
                        .await
                        .with_context(|| format!("re-applying mute after joining {}", channel))?;
                }
                self.on_local_joined();
            }
            EngineEvent::RemotePeerJoined { channel, peer_uid } => {
                if self.is_current(&channel) {
                    tracing::info!("Remote peer {} joined {}", peer_uid, channel);
                }
            }
            EngineEvent::RemotePeerLeft {
                channel,
                peer_uid,
                reason,
            } => {
                if !self.is_current(&channel) {
                    return Ok(());
                }
                match reason {
                    PeerLeftReason::Quit if self.state == CallState::Ongoing => {
                        tracing::info!("Remote peer {} left {}, hanging up", peer_uid, channel);
                        self.end_locally(false).await;
                    }
                    PeerLeftReason::Quit => {
                        tracing::debug!("Remote peer {} left {} ({})", peer_uid, channel, self.state);
                    }
                    PeerLeftReason::Dropped => {
                        tracing::warn!("Remote peer {} dropped from {}", peer_uid, channel);
                    }
                }
            }
            EngineEvent::LocalAudioFailed { reason } => {
                if let Some(active) = self.active.as_mut() {
                    tracing::warn!("Local audio failed in {}: {}", active.call_id(), reason);
                    active.audio.mark_failed();
                }
            }
            EngineEvent::LocalAudioRecovered => {
                if let Some(active) = self.active.as_mut() {
                    active.audio.mark_recovered();
                }
            }
            EngineEvent::NetworkQuality {
                rtt_ms,
                packet_loss,
            } => {
                tracing::debug!(
                    "Network quality: rtt={}ms loss={:.1}%",
                    rtt_ms,
                    packet_loss * 100.0
                );
            }
        }
        Ok(())
    }

    fn check_audio_health(&mut self) {
        if self.state != CallState::Ongoing {
            return;
        }
        let max_resets = self.config.audio_health.max_resets;
        let delay = self.config.audio_health.reset_delay();
        let engine = self.engine.clone();
        let mailbox = self.mailbox.clone();

        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.audio.should_reset(max_resets) {
            if active.audio.is_failed() && active.audio.resets() >= max_resets {
                tracing::debug!("Audio reset budget exhausted for {}", active.call_id());
            }
            return;
        }

        active.audio.begin_reset();
        tracing::info!(
            "Resetting local audio for {} ({}/{})",
            active.call_id(),
            active.audio.resets(),
            max_resets
        );

        let call_id = active.call_id().to_string();
        active.audio_reset_task = Some(tokio::spawn(async move {
            let succeeded = match reset_local_audio(engine.as_ref(), delay).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Local audio reset failed: {}", e);
                    false
                }
            };
            mailbox.send(Input::AudioResetFinished { call_id, succeeded });
        }));
    }

    fn on_audio_reset_finished(&mut self, call_id: &str, succeeded: bool) {
        if let Some(active) = self.active.as_mut().filter(|a| a.call_id() == call_id) {
            active.audio_reset_task = None;
            active.audio.finish_reset(succeeded);
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Beendet einen Anruf mit Fehler
    async fn fail_call(&mut self, error: CallError) {
        if !self.state.is_active() {
            tracing::warn!("Error without active call: {}", error);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let update = active.terminal_update(false);
        let call_id = active.call_id().to_string();
        active.duration_secs = Some(update.as_ref().and_then(|u| u.duration).unwrap_or(0));
        tracing::error!("Call {} failed: {}", call_id, error);

        self.teardown().await;
        if let Some(update) = update {
            self.publish_terminal(call_id, update);
        }
        self.transition(CallState::Error, Some(error));
    }

    /// Räumt Engine, UI und Tasks des aktiven Anrufs ab (je höchstens einmal)
    async fn teardown(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        // Ein abgebrochener Reset kann die Aufnahme ausgeschaltet zurücklassen
        let restore_capture = active.audio.is_resetting();
        active.cancel_tasks();
        let unmute = active.muted;
        let leave = !active.channel_left;
        let dismiss = active.ui_visible;
        active.channel_left = true;
        active.ui_visible = false;

        // Mute und Aufnahme gehören zum Anruf, die Engine überlebt ihn
        if restore_capture {
            if let Err(e) = self.engine.set_local_audio_enabled(true).await {
                tracing::warn!("Failed to re-enable local audio: {}", e);
            }
        }
        if unmute {
            match self.engine.mute_local(false).await {
                Ok(()) => {
                    if let Some(active) = self.active.as_mut() {
                        active.muted = false;
                    }
                }
                Err(e) => tracing::warn!("Failed to unmute after call: {}", e),
            }
        }
        if leave {
            if let Err(e) = self.engine.leave_channel().await {
                tracing::debug!("Leave channel failed: {}", e);
            }
        }
        if dismiss {
            self.ui.dismiss().await;
        }
    }

    /// Beendet einen laufenden Anruf und vergisst den alten
    async fn replace_active_call(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.end_locally(false).await;
        self.active = None;
        self.transition(CallState::Idle, None);
    }

    /// Terminaler Write, lokal ist der Übergang schon passiert
    fn publish_terminal(&self, call_id: String, update: RecordUpdate) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = write_terminal(store.as_ref(), &call_id, update).await {
                tracing::warn!("Terminal write for {} failed: {}", call_id, e);
            }
        });
    }

    fn on_linger(&mut self, call_id: &str) {
        let lingering = self
            .active
            .as_ref()
            .map(|a| a.call_id() == call_id)
            .unwrap_or(false);
        if lingering && self.state.is_terminal() {
            self.active = None;
            self.transition(CallState::Idle, None);
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn is_current(&self, channel: &str) -> bool {
        self.state.is_active()
            && self
                .active
                .as_ref()
                .map(|a| a.call_id() == channel)
                .unwrap_or(false)
    }

    fn forward_record(&self, call_id: &str, updates: RecordStream) -> JoinHandle<()> {
        forward(
            self.mailbox.clone(),
            updates,
            Input::Record,
            Some(Input::SubscriptionClosed {
                call_id: call_id.to_string(),
            }),
        )
    }

    fn arm_timer(&self, call_id: &str, timeout: std::time::Duration) -> RingTimeoutTimer {
        let mailbox = self.mailbox.clone();
        RingTimeoutTimer::arm(call_id, timeout, move |call_id| {
            mailbox.send(Input::RingTimeout { call_id });
        })
    }

    fn mark_seen(&mut self, call_id: &str) {
        if !self.seen_calls.insert(call_id.to_string()) {
            return;
        }
        self.seen_order.push_back(call_id.to_string());
        if self.seen_order.len() > SEEN_CALLS_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_calls.remove(&oldest);
            }
        }
    }

    fn transition(&mut self, next: CallState, error: Option<CallError>) {
        let previous = self.state;
        if previous == next && error.is_none() {
            return;
        }
        self.state = next;
        let call = self.active.as_ref().map(ActiveCall::summary);

        tracing::info!("Call state: {} -> {}", previous, next);
        self.publish_snapshot();
        let _ = self.events.send(CallStateChanged {
            previous,
            current: next,
            call,
            error,
        });

        if next.is_terminal() {
            self.schedule_linger();
        }
    }

    fn publish_snapshot(&self) {
        *self.snapshot.write() = SessionSnapshot {
            state: self.state,
            call: self.active.as_ref().map(ActiveCall::summary),
        };
    }

    fn schedule_linger(&mut self) {
        let delay = self.config.terminal_linger();
        let mailbox = self.mailbox.clone();
        if let Some(active) = self.active.as_mut() {
            let call_id = active.call_id().to_string();
            if let Some(previous) = active.linger_task.take() {
                previous.abort();
            }
            active.linger_task = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                mailbox.send(Input::Linger { call_id });
            }));
        }
    }
}

// ============================================================================
// STORE WRITES
// ============================================================================

/// Führt `op` aus und wiederholt einmal bei vorübergehenden Fehlern
async fn retry_once<T, F, Fut>(what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            tracing::warn!("Store {} failed ({}), retrying once", what, e);
            op().await
        }
        other => other,
    }
}

/// Schreibt einen terminalen Status und gleicht verlorene Rennen aus
///
/// Wurde der Anruf inzwischen angenommen, wird aus `missed`/`declined`
/// ein `ended` mit Dauer 0, damit die Gegenseite nicht allein in
/// `ongoing` hängen bleibt.
pub(crate) async fn write_terminal(
    store: &dyn SignalingStore,
    call_id: &str,
    update: RecordUpdate,
) -> Result<(), StoreError> {
    let requested = update.status;
    match retry_once("terminal write", || store.update(call_id, update.clone())).await {
        Ok(_) => Ok(()),
        Err(StoreError::InvalidTransition {
            current: CallStatus::Ongoing,
            ..
        }) if requested != CallStatus::Ended => {
            tracing::info!(
                "Call {} was answered meanwhile, writing ended instead of {}",
                call_id,
                requested
            );
            retry_once("terminal write", || {
                store.update(call_id, RecordUpdate::ended(0))
            })
            .await
            .map(|_| ())
        }
        Err(StoreError::InvalidTransition { current, .. }) if current.is_terminal() => {
            tracing::debug!("Call {} already {}", call_id, current);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
