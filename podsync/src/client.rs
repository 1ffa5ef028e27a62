//! WebSocket sync client for connecting to the pod server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, bounded reconnect backoff)
//! - Request/reply correlation over one socket (pending oneshot waiters)
//! - Event routing into the shared [`Reconciler`]
//! - Heartbeat pings
//!
//! Every server frame flows through one reader task:
//!
//! ```text
//!             ┌────────────── reader task ──────────────┐
//! ws frame ──►│ Reply  ──► absorb into reconciler,      │
//!             │            wake pending waiter          │
//!             │ Event  ──► skip own origin, merge,      │──► SyncEvent
//!             │            forward to application       │    channel
//!             │ Pong   ──► heartbeat bookkeeping        │
//!             └─────────────────────────────────────────┘
//! ```
//!
//! Replies are merged before the caller is woken, so a caller that gave up
//! waiting (timeout, dropped future) still ends up with the committed write
//! in its local view — the server finished the write either way.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use uuid::Uuid;

use crate::model::{Item, MemberProfile, Pod};
use crate::protocol::{
    ChangeEvent, Operation, ProtocolError, Reply, RequestEnvelope, ServerMessage, WireError,
};
use crate::reconciler::{MergeOutcome, Reconciler, ReconcilerStats};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A remote change was merged into the local view
    RemoteChange {
        event: ChangeEvent,
        outcome: MergeOutcome,
    },
}

/// Client-side failure taxonomy.
#[derive(Debug)]
pub enum ClientError {
    /// Frame could not be encoded/decoded
    Protocol(ProtocolError),
    /// The server rejected the operation
    Server(WireError),
    /// No usable connection (request never left this process)
    ConnectionClosed,
    /// The request left but no reply arrived in time; it may still commit
    Timeout,
    /// The reply variant did not match the operation
    UnexpectedReply(&'static str),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Server(e) => write!(f, "Server error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::UnexpectedReply(expected) => write!(f, "Unexpected reply, wanted {expected}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Tunables for one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for a direct reply
    pub request_timeout: Duration,
    /// Ping cadence; 0 disables the heartbeat task
    pub heartbeat_interval: Duration,
    /// First reconnect delay
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling (doubling stops here)
    pub reconnect_cap: Duration,
    /// Connection attempts before `connect_with_retry` gives up
    pub max_connect_attempts: u32,
    /// Re-enqueue attempts when a frame provably never left the process.
    /// In-flight requests are never retried: the write may have committed.
    pub send_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(20),
            reconnect_base: Duration::from_millis(250),
            reconnect_cap: Duration::from_secs(8),
            max_connect_attempts: 8,
            send_retries: 2,
        }
    }
}

/// Doubling backoff, saturating at the cap.
fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Reply, WireError>>>;

/// The sync client.
///
/// Owns the socket tasks and a shared [`Reconciler`]; both delivery paths
/// (direct replies, broadcast events) merge into it, so the view exposed by
/// [`pods`](Self::pods) / [`active_pod`](Self::active_pod) converges no
/// matter which path lands first.
pub struct PodClient {
    /// Client-minted session identity, carried on every request and echoed
    /// as the origin of resulting events
    session_id: Uuid,

    /// Who this client acts as
    profile: MemberProfile,

    /// Server URL (ws://host:port)
    server_url: String,

    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local merged view of this member's pods
    reconciler: Arc<Mutex<Reconciler>>,

    /// Waiters keyed by request id
    pending: Arc<Mutex<PendingMap>>,

    /// Next request id; 0 is reserved for heartbeat pings
    next_request: AtomicU64,

    /// Channel to the WebSocket writer task, swapped per connection
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection tasks)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Close signal; background timers select on it
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl PodClient {
    /// Create a new client. `server_url` like `ws://127.0.0.1:9100`.
    pub fn new(profile: MemberProfile, server_url: impl Into<String>) -> Self {
        Self::with_config(profile, server_url, ClientConfig::default())
    }

    pub fn with_config(
        profile: MemberProfile,
        server_url: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            session_id: Uuid::new_v4(),
            profile,
            server_url: server_url.into(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            reconciler: Arc::new(Mutex::new(Reconciler::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(1),
            outgoing: Arc::new(RwLock::new(None)),
            event_rx: Some(event_rx),
            event_tx,
            closed_tx,
            closed_rx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Connect to the server (single attempt).
    ///
    /// Spawns the writer, reader and heartbeat tasks for this connection.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if *self.closed_rx.borrow() {
            return Err(ClientError::ConnectionClosed);
        }
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.outgoing.write().await = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Session {} connected to {}", self.session_id, self.server_url);

        // Reader task: route every server frame
        let session_id = self.session_id;
        let state = self.state.clone();
        let pending = self.pending.clone();
        let reconciler = self.reconciler.clone();
        let outgoing = self.outgoing.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match ServerMessage::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                                continue;
                            }
                        };
                        Self::route_frame(frame, session_id, &pending, &reconciler, &event_tx)
                            .await;
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: drop the writer, fail every waiter
            *state.write().await = ConnectionState::Disconnected;
            *outgoing.write().await = None;
            pending.lock().await.clear();
            let _ = event_tx.send(SyncEvent::Disconnected).await;
            log::info!("Session {} disconnected", session_id);
        });

        self.spawn_heartbeat();
        Ok(())
    }

    /// Connect with doubling backoff between attempts, up to
    /// `max_connect_attempts`. The backoff timer is cancelled by
    /// [`close`](Self::close).
    pub async fn connect_with_retry(&self) -> Result<(), ClientError> {
        let mut delay = self.config.reconnect_base;
        let mut closed = self.closed_rx.clone();
        for attempt in 1..=self.config.max_connect_attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(_) if attempt < self.config.max_connect_attempts => {
                    *self.state.write().await = ConnectionState::Reconnecting;
                    log::info!(
                        "Connect attempt {attempt} failed, retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = closed.changed() => return Err(ClientError::ConnectionClosed),
                    }
                    delay = next_backoff(delay, self.config.reconnect_cap);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ClientError::ConnectionClosed)
    }

    /// Tear the client down: cancels timers, drops the writer, fails all
    /// pending requests. A closed client will not reconnect.
    pub async fn close(&self) {
        let _ = self.closed_tx.send(true);
        *self.outgoing.write().await = None;
        self.pending.lock().await.clear();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn spawn_heartbeat(&self) {
        if self.config.heartbeat_interval.is_zero() {
            return;
        }
        let interval = self.config.heartbeat_interval;
        let session_id = self.session_id;
        let outgoing = self.outgoing.clone();
        let mut closed = self.closed_rx.clone();
        tokio::spawn(async move {
            let ping = RequestEnvelope::new(0, session_id, Operation::Ping);
            let frame = match ping.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Heartbeat frame failed to encode: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = closed.changed() => break,
                }
                let tx = outgoing.read().await.clone();
                match tx {
                    Some(tx) if tx.send(frame.clone()).await.is_ok() => {}
                    // Writer gone: this connection's heartbeat is over
                    _ => break,
                }
            }
        });
    }

    async fn route_frame(
        frame: ServerMessage,
        session_id: Uuid,
        pending: &Arc<Mutex<PendingMap>>,
        reconciler: &Arc<Mutex<Reconciler>>,
        event_tx: &mpsc::Sender<SyncEvent>,
    ) {
        match frame {
            ServerMessage::Reply { request_id, result } => {
                // Merge before waking the waiter, so an abandoned call still
                // lands its committed write locally
                if let Ok(ref reply) = result {
                    reconciler.lock().await.absorb_reply(reply);
                }
                match pending.lock().await.remove(&request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => log::debug!("Reply for abandoned request {request_id}"),
                }
            }
            ServerMessage::Event { origin, event } => {
                // Our own writes arrived via the direct reply already
                if origin == session_id {
                    return;
                }
                let outcome = reconciler.lock().await.apply(&event);
                let _ = event_tx.send(SyncEvent::RemoteChange { event, outcome }).await;
            }
            ServerMessage::Pong => {
                log::trace!("Pong for session {session_id}");
            }
        }
    }

    // ─── Request plumbing ─────────────────────────────────────────────

    /// Send one request and await its correlated reply.
    async fn request(&self, op: Operation) -> Result<Reply, ClientError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let envelope = RequestEnvelope::new(request_id, self.session_id, op);
        let bytes = envelope.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if let Err(e) = self.enqueue(bytes).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result.map_err(ClientError::Server),
            // Waiter dropped by the reader teardown
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                // The write may still commit server-side; the reader merges
                // its reply regardless. Never silently re-send.
                self.pending.lock().await.remove(&request_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Enqueue a frame to the writer task. Retries only here: a failed
    /// enqueue means the frame never left this process.
    async fn enqueue(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        let mut attempt = 0;
        loop {
            let tx = self.outgoing.read().await.clone();
            let sent = match tx {
                Some(tx) => tx.send(bytes.clone()).await.is_ok(),
                None => false,
            };
            if sent {
                return Ok(());
            }
            if attempt >= self.config.send_retries || *self.closed_rx.borrow() {
                return Err(ClientError::ConnectionClosed);
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// Create a pod owned by this client's profile.
    pub async fn create_pod(&self, name: impl Into<String>) -> Result<Pod, ClientError> {
        let reply = self
            .request(Operation::CreatePod {
                name: name.into(),
                owner: self.profile.clone(),
            })
            .await?;
        match reply {
            Reply::Pod(pod) => Ok(pod),
            _ => Err(ClientError::UnexpectedReply("Pod")),
        }
    }

    /// Join a pod by invite code. Joining a pod this profile is already in
    /// returns the pod unchanged.
    pub async fn join_pod(&self, invite_code: impl Into<String>) -> Result<Pod, ClientError> {
        let reply = self
            .request(Operation::JoinPod {
                invite_code: invite_code.into(),
                member: self.profile.clone(),
            })
            .await?;
        match reply {
            Reply::Pod(pod) => Ok(pod),
            _ => Err(ClientError::UnexpectedReply("Pod")),
        }
    }

    /// Switch this session's live subscription to `pod_id`. Returns the
    /// pod's current snapshot and marks it active locally.
    pub async fn attach(&self, pod_id: Uuid) -> Result<Pod, ClientError> {
        let reply = self
            .request(Operation::Attach {
                member_id: self.profile.id,
                pod_id,
            })
            .await?;
        match reply {
            Reply::Attached { pod } => Ok(pod),
            _ => Err(ClientError::UnexpectedReply("Attached")),
        }
    }

    /// Add a product to a pod's cart. Re-adding a product increments its
    /// quantity instead of creating a second row.
    pub async fn add_item(
        &self,
        pod_id: Uuid,
        product_id: impl Into<String>,
        name: impl Into<String>,
        price: f64,
    ) -> Result<Item, ClientError> {
        let reply = self
            .request(Operation::AddItem {
                pod_id,
                product_id: product_id.into(),
                name: name.into(),
                price,
                added_by: self.profile.clone(),
            })
            .await?;
        match reply {
            Reply::Item { item, .. } => Ok(item),
            _ => Err(ClientError::UnexpectedReply("Item")),
        }
    }

    /// Set an item's quantity. `Ok(None)` means the quantity reached zero
    /// and the item was removed.
    pub async fn set_item_quantity(
        &self,
        item_id: Uuid,
        new_quantity: i32,
    ) -> Result<Option<Item>, ClientError> {
        let reply = self
            .request(Operation::SetItemQuantity { item_id, new_quantity })
            .await?;
        match reply {
            Reply::Item { item, .. } => Ok(Some(item)),
            Reply::Removed { .. } => Ok(None),
            _ => Err(ClientError::UnexpectedReply("Item or Removed")),
        }
    }

    /// Remove an item. Removing an already-removed item is ok.
    pub async fn remove_item(&self, item_id: Uuid) -> Result<(), ClientError> {
        let reply = self.request(Operation::RemoveItem { item_id }).await?;
        match reply {
            Reply::Removed { .. } | Reply::Ack => Ok(()),
            _ => Err(ClientError::UnexpectedReply("Removed")),
        }
    }

    /// Delete a pod this profile owns.
    pub async fn delete_pod(&self, pod_id: Uuid) -> Result<(), ClientError> {
        let reply = self
            .request(Operation::DeletePod {
                pod_id,
                requester_id: self.profile.id,
            })
            .await?;
        match reply {
            Reply::Ack => {
                // Ack carries no pod id, so the reader cannot do this
                self.reconciler.lock().await.remove_pod(pod_id);
                Ok(())
            }
            _ => Err(ClientError::UnexpectedReply("Ack")),
        }
    }

    /// Fetch this member's pod list, replacing the local snapshot. This is
    /// also the recovery path after missed events.
    pub async fn refresh_pods(&self) -> Result<Vec<Pod>, ClientError> {
        let reply = self
            .request(Operation::ListPods { member_id: self.profile.id })
            .await?;
        match reply {
            Reply::Pods(pods) => Ok(pods),
            _ => Err(ClientError::UnexpectedReply("Pods")),
        }
    }

    /// Fetch one pod's authoritative snapshot.
    pub async fn fetch_pod(&self, pod_id: Uuid) -> Result<Pod, ClientError> {
        let reply = self.request(Operation::FetchPod { pod_id }).await?;
        match reply {
            Reply::Pod(pod) => Ok(pod),
            _ => Err(ClientError::UnexpectedReply("Pod")),
        }
    }

    /// Record that this member surfaced the invite code (advisory).
    pub async fn share_invite(&self, pod_id: Uuid) -> Result<(), ClientError> {
        let reply = self
            .request(Operation::ShareInvite {
                pod_id,
                shared_by: self.profile.id,
            })
            .await?;
        match reply {
            Reply::Ack => Ok(()),
            _ => Err(ClientError::UnexpectedReply("Ack")),
        }
    }

    // ─── Local view ───────────────────────────────────────────────────

    /// Snapshot of the locally merged pod list.
    pub async fn pods(&self) -> Vec<Pod> {
        self.reconciler.lock().await.pods().to_vec()
    }

    /// Locally merged copy of one pod.
    pub async fn pod(&self, pod_id: Uuid) -> Option<Pod> {
        self.reconciler.lock().await.pod(pod_id).cloned()
    }

    /// The pod this session is attached to, as merged locally.
    pub async fn active_pod(&self) -> Option<Pod> {
        self.reconciler.lock().await.active_pod().cloned()
    }

    /// (total units, total price) for one pod's cart.
    pub async fn cart_totals(&self, pod_id: Uuid) -> Option<(u64, f64)> {
        self.reconciler.lock().await.cart_totals(pod_id)
    }

    pub async fn merge_stats(&self) -> ReconcilerStats {
        self.reconciler.lock().await.stats()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn profile(&self) -> &MemberProfile {
        &self.profile
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
