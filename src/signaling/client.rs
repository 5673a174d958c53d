//! WebSocket Client für den Signaling Store
//!
//! Verwaltet die WebSocket-Verbindung zum Signaling-Server:
//! - Request/Response Zuordnung über `requestId`
//! - Heartbeat gegen den Idle-Timeout des Servers
//! - Signierung jedes Requests
//! - Push von Record-Änderungen an die Subscriber

use super::messages::*;
use super::record::{RecordUpdate, SignalingRecord};
use super::store::{
    incoming_stream, record_stream, RecordStream, Refetch, SignalingStore, StoreError,
};
use crate::config::SignalingConfig;
use crate::crypto::KeyPair;
use async_trait::async_trait;
use chrono::Utc;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Antwort des Servers auf einen Request
#[derive(Debug, Default)]
struct Ack {
    record: Option<SignalingRecord>,
    records: Vec<SignalingRecord>,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Ack, StoreError>>>;

// ============================================================================
// CONNECTION STATE
// ============================================================================

struct Connection {
    keypair: Arc<KeyPair>,
    outgoing: mpsc::UnboundedSender<String>,
    pending: Mutex<PendingMap>,
    next_request_id: AtomicU64,
    /// `None` nach Verbindungsabbruch, damit alle Subscriptions enden
    snapshots: Mutex<Option<broadcast::Sender<SignalingRecord>>>,
    connected: AtomicBool,
    request_timeout: Duration,
}

impl Connection {
    /// Signiert und verschickt einen Request ohne auf Antwort zu warten
    fn send(&self, request: ClientRequest, request_id: u64) -> Result<(), StoreError> {
        let frame = sign_request(&self.keypair, request, request_id)
            .map_err(|e| StoreError::Backend(format!("failed to encode request: {}", e)))?;
        self.outgoing
            .send(frame)
            .map_err(|_| StoreError::Unavailable("not connected".into()))
    }

    async fn request(&self, request: ClientRequest) -> Result<Ack, StoreError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("not connected".into()));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send(request, request_id) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::Unavailable("connection closed".into())),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(StoreError::Unavailable(format!(
                    "request {} timed out",
                    request_id
                )))
            }
        }
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Ack {
                request_id,
                record,
                records,
            } => self.resolve(request_id, Ok(Ack { record, records })),

            ServerMessage::Record { record } => {
                tracing::debug!("Record push {} ({})", record.call_id, record.status);
                if let Some(snapshots) = self.snapshots.lock().as_ref() {
                    let _ = snapshots.send(record);
                }
            }

            ServerMessage::Error {
                request_id,
                code,
                message,
                call_id,
                current,
                requested,
            } => {
                let error = store_error_from_wire(code, message, call_id, current, requested);
                match request_id {
                    Some(id) => self.resolve(id, Err(error)),
                    None => tracing::error!("Server error: {}", error),
                }
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    fn resolve(&self, request_id: u64, result: Result<Ack, StoreError>) {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!("Response for unknown request {}", request_id),
        }
    }

    fn subscribe_snapshots(&self) -> Result<broadcast::Receiver<SignalingRecord>, StoreError> {
        self.snapshots
            .lock()
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| StoreError::Unavailable("not connected".into()))
    }

    /// Verbindung weg: offene Requests scheitern sofort, Subscriptions enden
    fn disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.snapshots.lock().take();
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(StoreError::Unavailable("connection closed".into())));
        }
    }
}

/// Baut den Umschlag und signiert ihn
fn sign_request(
    keypair: &KeyPair,
    request: ClientRequest,
    request_id: u64,
) -> Result<String, serde_json::Error> {
    let mut body = serde_json::to_value(SignedRequest {
        request,
        request_id,
        timestamp: Utc::now().timestamp_millis(),
        signature: String::new(),
    })?;

    let signature = keypair.sign_request(&body);
    if let Some(obj) = body.as_object_mut() {
        obj.insert("signature".to_string(), serde_json::Value::String(signature));
    }
    serde_json::to_string(&body)
}

/// `https://host/path` -> `wss://host/path/ws`
fn websocket_url(server_url: &str) -> Result<Url, StoreError> {
    let mut url = Url::parse(server_url)
        .map_err(|e| StoreError::Backend(format!("invalid signaling url {}: {}", server_url, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(StoreError::Backend(format!(
                "unsupported signaling url scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| StoreError::Backend(format!("cannot use scheme {}", scheme)))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

// ============================================================================
// REMOTE SIGNALING STORE
// ============================================================================

/// Signaling Store auf dem Server, angebunden über WebSocket
pub struct RemoteSignalingStore {
    user_id: String,
    connection: Arc<Connection>,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteSignalingStore {
    /// Verbindet und authentifiziert `user_id`
    pub async fn connect(
        config: &SignalingConfig,
        user_id: &str,
        keypair: Arc<KeyPair>,
    ) -> Result<Self, StoreError> {
        config
            .validate()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let ws_url = websocket_url(&config.url)?;
        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| StoreError::Unavailable(format!("WebSocket connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (snapshots, _) = broadcast::channel(256);
        let connection = Arc::new(Connection {
            keypair: Arc::clone(&keypair),
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            snapshots: Mutex::new(Some(snapshots)),
            connected: AtomicBool::new(true),
            request_timeout: config.request_timeout(),
        });

        // Read-Task
        let reader = Arc::clone(&connection);
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => reader.handle_server_message(server_msg),
                        Err(e) => tracing::warn!("Unparseable server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            reader.disconnected();
        });

        // Write-Task
        let write_task = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Heartbeat-Task, Cloudflare Workers trennt sonst idle Verbindungen
        let heartbeat = Arc::clone(&connection);
        let heartbeat_interval = config.heartbeat_interval();
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !heartbeat.connected.load(Ordering::SeqCst) {
                    break;
                }
                let request_id = heartbeat.next_request_id.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = heartbeat.send(ClientRequest::Heartbeat {}, request_id) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        });

        let store = Self {
            user_id: user_id.to_string(),
            connection,
            tasks: vec![read_task, write_task, heartbeat_task],
        };

        store
            .connection
            .request(ClientRequest::Authenticate {
                user_id: user_id.to_string(),
                public_key: keypair.public_key_base64(),
            })
            .await?;
        tracing::info!("Authenticated with signaling server as {}", user_id);

        Ok(store)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RemoteSignalingStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RemoteSignalingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSignalingStore")
            .field("user_id", &self.user_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl SignalingStore for RemoteSignalingStore {
    async fn create(&self, record: SignalingRecord) -> Result<(), StoreError> {
        self.connection
            .request(ClientRequest::CreateRecord { record })
            .await
            .map(|_| ())
    }

    async fn update(
        &self,
        call_id: &str,
        update: RecordUpdate,
    ) -> Result<SignalingRecord, StoreError> {
        self.connection
            .request(ClientRequest::UpdateRecord {
                call_id: call_id.to_string(),
                update,
            })
            .await?
            .record
            .ok_or_else(|| StoreError::Backend("update ack without record".into()))
    }

    async fn get(&self, call_id: &str) -> Result<SignalingRecord, StoreError> {
        self.connection
            .request(ClientRequest::GetRecord {
                call_id: call_id.to_string(),
            })
            .await?
            .record
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))
    }

    async fn subscribe(&self, call_id: &str) -> Result<RecordStream, StoreError> {
        // Erst lokal abonnieren, dann beim Server: kein Push geht verloren
        let rx = self.connection.subscribe_snapshots()?;
        let ack = self
            .connection
            .request(ClientRequest::Subscribe {
                call_id: call_id.to_string(),
            })
            .await?;

        let connection = Arc::clone(&self.connection);
        let id = call_id.to_string();
        let refetch: Refetch = Box::new(move || {
            let connection = Arc::clone(&connection);
            let call_id = id.clone();
            async move {
                connection
                    .request(ClientRequest::GetRecord { call_id })
                    .await
                    .ok()
                    .and_then(|ack| ack.record)
            }
            .boxed()
        });
        Ok(record_stream(ack.record, rx, call_id, refetch))
    }

    async fn subscribe_incoming(&self, self_id: &str) -> Result<RecordStream, StoreError> {
        let rx = self.connection.subscribe_snapshots()?;
        let ack = self
            .connection
            .request(ClientRequest::SubscribeIncoming {
                user_id: self_id.to_string(),
            })
            .await?;
        Ok(incoming_stream(ack.records, rx, self_id))
    }
}

// ============================================================================
// TESTS
// ============================================================================
