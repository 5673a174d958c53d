//! Fakes für Engine, UI, Berechtigungen und Store

use crate::config::CoordinatorConfig;
use crate::media::{
    AudioProfile, ChannelOptions, EngineConfig, EngineEvent, MediaEngineAdapter, MediaError,
};
use crate::platform::{CallInfo, CallUi, PermissionGate};
use crate::session::{CallSessionCoordinator, CallState, CallStateChanged, Collaborators};
use crate::signaling::{
    receiver_stream, MemorySignalingStore, RecordStream, RecordUpdate, SignalingRecord,
    SignalingStore, StoreError,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// EVENT LOG
// ============================================================================

/// Gemeinsames, geordnetes Protokoll aller Aufrufe an die Fakes
#[derive(Debug, Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Index des ersten Eintrags mit diesem Präfix
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e.starts_with(prefix))
    }
}

// ============================================================================
// FAKE ENGINE
// ============================================================================

pub(crate) struct FakeEngine {
    log: EventLog,
    events: broadcast::Sender<EngineEvent>,
    fail_init: AtomicBool,
    fail_mute: AtomicBool,
    pending_join_failures: AtomicU32,
    join_attempts: AtomicU32,
    leaves: AtomicU32,
    join_options: Mutex<Vec<ChannelOptions>>,
    profiles: Mutex<Vec<AudioProfile>>,
    local_audio: Mutex<Vec<bool>>,
    muted: AtomicBool,
    speaker: AtomicBool,
}

impl FakeEngine {
    pub fn new(log: EventLog) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            log,
            events,
            fail_init: AtomicBool::new(false),
            fail_mute: AtomicBool::new(false),
            pending_join_failures: AtomicU32::new(0),
            join_attempts: AtomicU32::new(0),
            leaves: AtomicU32::new(0),
            join_options: Mutex::new(Vec::new()),
            profiles: Mutex::new(Vec::new()),
            local_audio: Mutex::new(Vec::new()),
            muted: AtomicBool::new(false),
            speaker: AtomicBool::new(false),
        }
    }

    pub fn fail_next_joins(&self, n: u32) {
        self.pending_join_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mute(&self, fail: bool) {
        self.fail_mute.store(fail, Ordering::SeqCst);
    }

    /// Simuliert eine Änderung der Audio-Route durch das Betriebssystem
    pub fn set_os_speaker_route(&self, enabled: bool) {
        self.speaker.store(enabled, Ordering::SeqCst);
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn join_attempts(&self) -> u32 {
        self.join_attempts.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> u32 {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn join_options(&self) -> Vec<ChannelOptions> {
        self.join_options.lock().clone()
    }

    pub fn profiles(&self) -> Vec<AudioProfile> {
        self.profiles.lock().clone()
    }

    pub fn local_audio_toggles(&self) -> Vec<bool> {
        self.local_audio.lock().clone()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngineAdapter for FakeEngine {
    async fn initialize(&self, _config: &EngineConfig) -> Result<(), MediaError> {
        self.log.push("engine.init");
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(MediaError::InitFailed("no audio session".into()));
        }
        Ok(())
    }

    async fn configure_audio_profile(&self, profile: AudioProfile) -> Result<(), MediaError> {
        self.log.push(format!("engine.profile:{:?}", profile));
        self.profiles.lock().push(profile);
        Ok(())
    }

    async fn join_channel(
        &self,
        channel: &str,
        options: &ChannelOptions,
    ) -> Result<(), MediaError> {
        self.join_attempts.fetch_add(1, Ordering::SeqCst);
        self.join_options.lock().push(options.clone());
        self.log.push(format!("engine.join:{}", channel));

        let remaining = self.pending_join_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pending_join_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(MediaError::JoinFailed {
                channel: channel.to_string(),
                reason: "engine not ready".into(),
            });
        }

        self.emit(EngineEvent::LocalJoined {
            channel: channel.to_string(),
        });
        Ok(())
    }

    async fn leave_channel(&self) -> Result<(), MediaError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        self.log.push("engine.leave");
        Ok(())
    }

    async fn set_local_audio_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.local_audio.lock().push(enabled);
        Ok(())
    }

    async fn mute_local(&self, muted: bool) -> Result<(), MediaError> {
        if self.fail_mute.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("mute rejected".into()));
        }
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    async fn set_speakerphone(&self, enabled: bool) -> Result<(), MediaError> {
        self.speaker.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn speakerphone_enabled(&self) -> Result<bool, MediaError> {
        Ok(self.speaker.load(Ordering::SeqCst))
    }

    fn events(&self) -> BoxStream<'static, EngineEvent> {
        receiver_stream(self.events.subscribe())
    }
}

// ============================================================================
// FAKE UI & PERMISSIONS
// ============================================================================

pub(crate) struct FakeUi {
    log: EventLog,
    shown: Mutex<Vec<CallInfo>>,
    dismissals: AtomicU32,
}

impl FakeUi {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            shown: Mutex::new(Vec::new()),
            dismissals: AtomicU32::new(0),
        }
    }

    pub fn shown(&self) -> Vec<CallInfo> {
        self.shown.lock().clone()
    }

    pub fn dismissals(&self) -> u32 {
        self.dismissals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallUi for FakeUi {
    async fn show(&self, info: &CallInfo) {
        self.log.push(format!("ui.show:{}", info.call_id));
        self.shown.lock().push(info.clone());
    }

    async fn dismiss(&self) {
        self.log.push("ui.dismiss");
        self.dismissals.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakePermissions {
    log: EventLog,
    granted: AtomicBool,
}

impl FakePermissions {
    pub fn new(log: EventLog, granted: bool) -> Self {
        Self {
            log,
            granted: AtomicBool::new(granted),
        }
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

#[async_trait]
impl PermissionGate for FakePermissions {
    async fn request_permissions(&self, needs_video: bool) -> bool {
        self.log.push(format!(
            "permissions:{}",
            if needs_video { "video" } else { "audio" }
        ));
        self.granted.load(Ordering::SeqCst)
    }
}

// ============================================================================
// RECORDING STORE
// ============================================================================

/// MemorySignalingStore mit Protokoll und Fehlerinjektion
pub(crate) struct RecordingStore {
    inner: MemorySignalingStore,
    log: Mutex<Option<EventLog>>,
    failing_updates: AtomicU32,
    update_calls: AtomicU32,
    closer: broadcast::Sender<()>,
}

impl RecordingStore {
    pub fn new() -> Self {
        let (closer, _) = broadcast::channel(1);
        Self {
            inner: MemorySignalingStore::new(),
            log: Mutex::new(None),
            failing_updates: AtomicU32::new(0),
            update_calls: AtomicU32::new(0),
            closer,
        }
    }

    /// Beendet alle offenen Record-Subscriptions wie ein Verbindungsabbruch
    pub fn close_subscriptions(&self) {
        let _ = self.closer.send(());
    }

    pub fn attach_log(&self, log: EventLog) {
        *self.log.lock() = Some(log);
    }

    /// Die nächsten `n` Updates schlagen mit `Unavailable` fehl
    pub fn fail_next_updates(&self, n: u32) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemorySignalingStore {
        &self.inner
    }

    fn record(&self, entry: String) {
        if let Some(log) = self.log.lock().as_ref() {
            log.push(entry);
        }
    }
}

#[async_trait]
impl SignalingStore for RecordingStore {
    async fn create(&self, record: SignalingRecord) -> Result<(), StoreError> {
        self.record(format!("store.create:{}", record.call_id));
        self.inner.create(record).await
    }

    async fn update(
        &self,
        call_id: &str,
        update: RecordUpdate,
    ) -> Result<SignalingRecord, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_updates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_updates.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.record(format!("store.update:{}:{}", call_id, update.status));
        self.inner.update(call_id, update).await
    }

    async fn get(&self, call_id: &str) -> Result<SignalingRecord, StoreError> {
        self.inner.get(call_id).await
    }

    async fn subscribe(&self, call_id: &str) -> Result<RecordStream, StoreError> {
        let mut closed = self.closer.subscribe();
        let updates = self.inner.subscribe(call_id).await?;
        Ok(updates
            .take_until(async move {
                let _ = closed.recv().await;
            })
            .boxed())
    }

    async fn subscribe_incoming(&self, self_id: &str) -> Result<RecordStream, StoreError> {
        self.inner.subscribe_incoming(self_id).await
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub(crate) fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.recovery.backoff_ms = 100;
    config.recovery.jitter_ms = 0;
    config.terminal_linger_ms = 60_000;
    config
}

/// Ein Peer mit eigenem Coordinator und eigenen Fakes
pub(crate) struct Peer {
    pub coordinator: CallSessionCoordinator,
    pub engine: Arc<FakeEngine>,
    pub ui: Arc<FakeUi>,
    pub permissions: Arc<FakePermissions>,
    pub log: EventLog,
    pub events: broadcast::Receiver<CallStateChanged>,
}

impl Peer {
    pub fn spawn(self_id: &str, store: Arc<RecordingStore>) -> Self {
        Self::spawn_with(self_id, store, test_config())
    }

    pub fn spawn_with(self_id: &str, store: Arc<RecordingStore>, config: CoordinatorConfig) -> Self {
        let log = EventLog::default();
        let engine = Arc::new(FakeEngine::new(log.clone()));
        let ui = Arc::new(FakeUi::new(log.clone()));
        let permissions = Arc::new(FakePermissions::new(log.clone(), true));

        let coordinator = CallSessionCoordinator::spawn(
            self_id,
            config,
            Collaborators {
                store,
                engine: engine.clone(),
                ui: ui.clone(),
                permissions: permissions.clone(),
            },
        )
        .unwrap();
        let events = coordinator.subscribe();

        Self {
            coordinator,
            engine,
            ui,
            permissions,
            log,
            events,
        }
    }

    /// Wartet bis `target` erreicht ist und gibt das Event zurück
    pub async fn wait_for(&mut self, target: CallState, within: Duration) -> CallStateChanged {
        self.states_until(target, within).await.1
    }

    /// Wie `wait_for`, liefert zusätzlich alle Zustände davor
    pub async fn states_until(
        &mut self,
        target: CallState,
        within: Duration,
    ) -> (Vec<CallState>, CallStateChanged) {
        let deadline = tokio::time::Instant::now() + within;
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| {
                    panic!(
                        "{} never reached {:?} (now {:?}, saw {:?})",
                        self.coordinator.self_id(),
                        target,
                        self.coordinator.state(),
                        seen
                    )
                })
                .expect("event channel closed");
            if event.current == target {
                return (seen, event);
            }
            seen.push(event.current);
        }
    }

    /// Alle bisher angefallenen Zustände (ohne zu warten)
    pub fn drain_states(&mut self) -> Vec<CallState> {
        let mut states = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            states.push(event.current);
        }
        states
    }
}

/// Lässt die Tasks der Coordinators laufen ohne die Uhr weit vorzudrehen
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wartet bis der Record den gewünschten Status hat
pub(crate) async fn wait_for_status(
    store: &RecordingStore,
    call_id: &str,
    status: crate::signaling::CallStatus,
) -> SignalingRecord {
    for _ in 0..500 {
        if let Ok(record) = store.get(call_id).await {
            if record.status == status {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record {} never reached {}", call_id, status);
}
