//! WebSocket sync server wiring the coordinator, bus and registry together.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── RequestEnvelope ──► WriteCoordinator ── PodTable
//! Client B ──┘                            │                 │
//!                                         │           PodStore (RocksDB,
//!                                         │            write-through)
//!                                         ▼
//!                                       PodBus (one channel per pod)
//!                                         │
//!                          ┌──────────────┼──────────────┐
//!                          ▼              ▼              ▼
//!                      session A      session B      session C
//! ```
//!
//! Each connection runs one `select!` loop over its WebSocket and its
//! current bus receiver. A session receives events only for the pod it is
//! attached to; `Attach` swaps the receiver (subscribe → snapshot → registry
//! swap → reply), so there is no window where a session is subscribed to
//! nothing it asked for. Events the session itself caused are filtered here
//! by origin, before they hit the socket.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::bus::{BusMessage, PodBus};
use crate::coordinator::{QuantityOutcome, WriteCoordinator, WriteStats};
use crate::model::Pod;
use crate::protocol::{Operation, Reply, RequestEnvelope, ServerMessage, WireError};
use crate::session::SessionRegistry;
use crate::store::{PodStore, PodTable, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per pod
    pub broadcast_capacity: usize,
    /// Upper bound on one attach attempt before it is retried
    pub attach_timeout_ms: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            broadcast_capacity: 256,
            attach_timeout_ms: 2_000,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Events written to client sockets
    pub events_forwarded: u64,
    /// Events a lagging session missed (it recovers by re-fetch)
    pub events_dropped: u64,
    pub active_pods: usize,
    pub active_sessions: usize,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The sync server.
pub struct PodServer {
    config: ServerConfig,
    table: Arc<PodTable>,
    bus: Arc<PodBus>,
    registry: Arc<SessionRegistry>,
    coordinator: Arc<WriteCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<PodStore>>,
}

impl PodServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let table = Arc::new(PodTable::new());
        let bus = Arc::new(PodBus::new(config.broadcast_capacity));
        let registry = Arc::new(SessionRegistry::new());

        // Open persistent storage if configured
        let store = config.storage_path.as_ref().map(|path| {
            let store_config = StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            };
            Arc::new(PodStore::open(store_config).expect("Failed to open pod store"))
        });

        let coordinator = Arc::new(match &store {
            Some(s) => WriteCoordinator::with_store(table.clone(), bus.clone(), s.clone()),
            None => WriteCoordinator::new(table.clone(), bus.clone()),
        });

        Self {
            config,
            table,
            bus,
            registry,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Load persisted pods into the table and rebuild the invite/item
    /// indexes. Called by [`run`](Self::run); exposed for tests.
    pub async fn recover(&self) -> Result<usize, Box<dyn std::error::Error>> {
        Ok(self.coordinator.recover().await?)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} pods from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Pod sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let bus = self.bus.clone();
            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let attach_timeout = Duration::from_millis(self.config.attach_timeout_ms);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream, addr, coordinator, bus, registry, stats, attach_timeout,
                )
                .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<WriteCoordinator>,
        bus: Arc<PodBus>,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        attach_timeout: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut session_id: Option<Uuid> = None;
        let mut bus_rx: Option<broadcast::Receiver<BusMessage>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let envelope = match RequestEnvelope::decode(&bytes) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    log::warn!("Failed to decode request from {addr}: {e}");
                                    continue;
                                }
                            };
                            session_id = Some(envelope.session);

                            match envelope.op {
                                Operation::Ping => {
                                    let pong = ServerMessage::Pong.encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                }
                                Operation::Attach { member_id, pod_id } => {
                                    let result = Self::attach_session(
                                        &coordinator,
                                        &bus,
                                        &registry,
                                        envelope.session,
                                        member_id,
                                        pod_id,
                                        attach_timeout,
                                    )
                                    .await;
                                    let reply = match result {
                                        Ok((pod, rx, previous)) => {
                                            // Swap drops the old receiver;
                                            // only then can its channel be idle
                                            bus_rx = Some(rx);
                                            if let Some(prev) = previous {
                                                if prev != pod_id {
                                                    bus.remove_if_idle(prev).await;
                                                }
                                            }
                                            log::info!(
                                                "Session {} attached to pod {pod_id}",
                                                envelope.session
                                            );
                                            Ok(Reply::Attached { pod })
                                        }
                                        // Failed attach keeps the old subscription
                                        Err(e) => Err(e),
                                    };
                                    let frame =
                                        ServerMessage::reply(envelope.request_id, reply).encode()?;
                                    ws_sender.send(Message::Binary(frame.into())).await?;
                                }
                                op => {
                                    let result =
                                        Self::dispatch(&coordinator, &registry, envelope.session, op)
                                            .await;
                                    let frame =
                                        ServerMessage::reply(envelope.request_id, result).encode()?;
                                    ws_sender.send(Message::Binary(frame.into())).await?;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Event from the attached pod's channel
                msg = async {
                    match bus_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not attached yet — wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(bus_msg) => {
                            // The originator already has this change from
                            // its direct reply
                            if Some(bus_msg.origin) == session_id {
                                continue;
                            }
                            Self::forward_event(&mut ws_sender, &bus_msg, &stats).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Session {session_id:?} lagged by {n} events");
                            let mut s = stats.write().await;
                            s.events_dropped += n;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            // Pod deleted; the client discovers via re-fetch
                            log::debug!("Pod channel closed for session {session_id:?}");
                            bus_rx = None;
                        }
                    }
                }
            }
        }

        // Cleanup: detach and release interest in the pod's channel
        if let Some(sid) = session_id {
            if let Some(entry) = registry.detach(sid).await {
                drop(bus_rx);
                bus.remove_if_idle(entry.pod_id).await;
            }
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        Ok(())
    }

    /// Subscribe to the pod's channel, snapshot it, then swap the registry
    /// entry — in that order, so no committed event between the steps can be
    /// missed (an early event merges idempotently on top of the snapshot).
    ///
    /// One attempt is bounded by `attach_timeout` and retried once, so a
    /// connection is never parked in a neither-subscribed state.
    async fn attach_session(
        coordinator: &Arc<WriteCoordinator>,
        bus: &Arc<PodBus>,
        registry: &Arc<SessionRegistry>,
        session_id: Uuid,
        member_id: Uuid,
        pod_id: Uuid,
        attach_timeout: Duration,
    ) -> Result<(Pod, broadcast::Receiver<BusMessage>, Option<Uuid>), WireError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match tokio::time::timeout(
                attach_timeout,
                Self::try_attach(coordinator, bus, registry, session_id, member_id, pod_id),
            )
            .await
            {
                Ok(result) => return result,
                Err(_) if attempts == 1 => {
                    log::warn!("Attach to {pod_id} for session {session_id} timed out, retrying");
                }
                Err(_) => {
                    return Err(WireError::Internal(format!(
                        "attach to pod {pod_id} timed out"
                    )))
                }
            }
        }
    }

    async fn try_attach(
        coordinator: &Arc<WriteCoordinator>,
        bus: &Arc<PodBus>,
        registry: &Arc<SessionRegistry>,
        session_id: Uuid,
        member_id: Uuid,
        pod_id: Uuid,
    ) -> Result<(Pod, broadcast::Receiver<BusMessage>, Option<Uuid>), WireError> {
        let channel = bus.get_or_create(pod_id).await;
        let rx = channel.subscribe();

        let pod = match coordinator.get_pod(pod_id).await {
            Ok(pod) => pod,
            Err(e) => {
                // Release the speculative subscription before bailing
                drop(rx);
                bus.remove_if_idle(pod_id).await;
                return Err(e.into());
            }
        };

        let previous = registry.attach(session_id, member_id, pod_id).await;
        Ok((pod, rx, previous))
    }

    /// Route one operation to the coordinator and shape the reply.
    async fn dispatch(
        coordinator: &Arc<WriteCoordinator>,
        registry: &Arc<SessionRegistry>,
        session: Uuid,
        op: Operation,
    ) -> Result<Reply, WireError> {
        match op {
            Operation::CreatePod { name, owner } => coordinator
                .create_pod(session, &name, &owner)
                .await
                .map(Reply::Pod)
                .map_err(Into::into),

            Operation::JoinPod { invite_code, member } => coordinator
                .join_pod(session, &invite_code, &member)
                .await
                .map(Reply::Pod)
                .map_err(Into::into),

            Operation::AddItem { pod_id, product_id, name, price, added_by } => coordinator
                .add_item(session, pod_id, &product_id, &name, price, &added_by)
                .await
                .map(|item| Reply::Item { pod_id, item })
                .map_err(Into::into),

            Operation::SetItemQuantity { item_id, new_quantity } => coordinator
                .set_item_quantity(session, item_id, new_quantity)
                .await
                .map(|outcome| match outcome {
                    QuantityOutcome::Updated { pod_id, item } => Reply::Item { pod_id, item },
                    QuantityOutcome::Removed { pod_id, item_id } => {
                        Reply::Removed { pod_id, item_id }
                    }
                })
                .map_err(Into::into),

            Operation::RemoveItem { item_id } => coordinator
                .remove_item(session, item_id)
                .await
                .map(|removed| match removed {
                    Some((pod_id, item_id)) => Reply::Removed { pod_id, item_id },
                    // Already gone: still ok
                    None => Reply::Ack,
                })
                .map_err(Into::into),

            Operation::DeletePod { pod_id, requester_id } => {
                coordinator.delete_pod(session, pod_id, requester_id).await?;
                let detached = registry.detach_pod(pod_id).await;
                if detached > 0 {
                    log::info!("Detached {detached} sessions from deleted pod {pod_id}");
                }
                Ok(Reply::Ack)
            }

            Operation::ListPods { member_id } => {
                Ok(Reply::Pods(coordinator.list_pods(member_id).await))
            }

            Operation::FetchPod { pod_id } => coordinator
                .get_pod(pod_id)
                .await
                .map(Reply::Pod)
                .map_err(Into::into),

            Operation::ShareInvite { pod_id, shared_by } => coordinator
                .share_invite(session, pod_id, shared_by)
                .await
                .map(|_| Reply::Ack)
                .map_err(Into::into),

            // Handled by the connection loop before dispatch
            Operation::Attach { .. } | Operation::Ping => Err(WireError::Internal(
                "operation handled by the connection loop".to_string(),
            )),
        }
    }

    async fn forward_event(
        ws_sender: &mut WsSink,
        bus_msg: &BusMessage,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        ws_sender
            .send(Message::Binary(bus_msg.frame.to_vec().into()))
            .await?;
        let mut s = stats.write().await;
        s.events_forwarded += 1;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut snapshot = self.stats.read().await.clone();
        snapshot.active_pods = self.bus.channel_count().await;
        snapshot.active_sessions = self.registry.count().await;
        snapshot
    }

    /// Write-side counters (commits, publishes, rejections).
    pub fn write_stats(&self) -> WriteStats {
        self.coordinator.stats()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Direct handle to the write side, for embedding and tests.
    pub fn coordinator(&self) -> &Arc<WriteCoordinator> {
        &self.coordinator
    }

    /// The authoritative in-memory table.
    pub fn table(&self) -> &Arc<PodTable> {
        &self.table
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<PodStore>> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MemberProfile;

    fn profile(name: &str) -> MemberProfile {
        MemberProfile::new(Uuid::new_v4(), name.to_string(), format!("{name}.png"))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9100");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.attach_timeout_ms, 2_000);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = PodServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9100");
        assert!(server.store().is_none());
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            broadcast_capacity: 512,
            attach_timeout_ms: 500,
            storage_path: None,
        };
        let server = PodServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = PodServer::with_storage("127.0.0.1:0", dir.path().join("db"));
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = PodServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.events_forwarded, 0);
        assert_eq!(stats.events_dropped, 0);
        assert_eq!(stats.active_pods, 0);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_server_recovery_empty() {
        let server = PodServer::with_defaults();
        let recovered = server.recover().await.unwrap();
        assert_eq!(recovered, 0);
    }

    #[tokio::test]
    async fn test_server_recovery_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");
        let owner = profile("ava");
        let pod_id;

        // Persist a pod, then drop the store
        {
            let store = PodStore::open(StoreConfig::for_testing(&db_path)).unwrap();
            let pod = Pod::new("Persisted".to_string(), &owner, "AB12CD".to_string());
            pod_id = pod.id;
            store.put_pod(&pod).unwrap();
        }

        // A fresh server over the same path recovers it
        let server = PodServer::with_storage("127.0.0.1:0", &db_path);
        let recovered = server.recover().await.unwrap();
        assert_eq!(recovered, 1);

        let pod = server.coordinator().get_pod(pod_id).await.unwrap();
        assert_eq!(pod.name, "Persisted");
        // Indexes were rebuilt: the invite code resolves again
        assert_eq!(server.table().pod_id_by_invite("AB12CD").await, Some(pod_id));
    }

    #[tokio::test]
    async fn test_dispatch_create_and_fetch() {
        let server = PodServer::with_defaults();
        let owner = profile("ben");
        let session = Uuid::new_v4();

        let reply = PodServer::dispatch(
            server.coordinator(),
            &server.registry,
            session,
            Operation::CreatePod { name: "Weekend".to_string(), owner: owner.clone() },
        )
        .await
        .unwrap();
        let pod = match reply {
            Reply::Pod(pod) => pod,
            other => panic!("wrong reply: {other:?}"),
        };

        let reply = PodServer::dispatch(
            server.coordinator(),
            &server.registry,
            session,
            Operation::FetchPod { pod_id: pod.id },
        )
        .await
        .unwrap();
        assert_eq!(reply, Reply::Pod(pod));
    }

    #[tokio::test]
    async fn test_dispatch_remove_unknown_item_is_ack() {
        let server = PodServer::with_defaults();
        let reply = PodServer::dispatch(
            server.coordinator(),
            &server.registry,
            Uuid::new_v4(),
            Operation::RemoveItem { item_id: Uuid::new_v4() },
        )
        .await
        .unwrap();
        assert_eq!(reply, Reply::Ack);
    }

    #[tokio::test]
    async fn test_dispatch_delete_detaches_sessions() {
        let server = PodServer::with_defaults();
        let owner = profile("cal");
        let session = Uuid::new_v4();

        let reply = PodServer::dispatch(
            server.coordinator(),
            &server.registry,
            session,
            Operation::CreatePod { name: "Doomed".to_string(), owner: owner.clone() },
        )
        .await
        .unwrap();
        let pod = match reply {
            Reply::Pod(pod) => pod,
            other => panic!("wrong reply: {other:?}"),
        };

        server.registry.attach(session, owner.id, pod.id).await;
        assert_eq!(server.registry.count().await, 1);

        let reply = PodServer::dispatch(
            server.coordinator(),
            &server.registry,
            session,
            Operation::DeletePod { pod_id: pod.id, requester_id: owner.id },
        )
        .await
        .unwrap();
        assert_eq!(reply, Reply::Ack);
        assert_eq!(server.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_attach_unknown_pod_keeps_channel_map_clean() {
        let server = PodServer::with_defaults();
        let result = PodServer::try_attach(
            server.coordinator(),
            &server.bus,
            &server.registry,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        )
        .await;
        match result {
            Err(WireError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
        // The speculative channel was torn down again
        assert_eq!(server.bus.channel_count().await, 0);
        assert_eq!(server.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_attach_swaps_registry_entry() {
        let server = PodServer::with_defaults();
        let owner = profile("dee");
        let session = Uuid::new_v4();

        let pod_a = server
            .coordinator()
            .create_pod(session, "A", &owner)
            .await
            .unwrap();
        let pod_b = server
            .coordinator()
            .create_pod(session, "B", &owner)
            .await
            .unwrap();

        let (_, _rx_a, previous) = PodServer::try_attach(
            server.coordinator(),
            &server.bus,
            &server.registry,
            session,
            owner.id,
            pod_a.id,
        )
        .await
        .unwrap();
        assert_eq!(previous, None);

        let (_, _rx_b, previous) = PodServer::try_attach(
            server.coordinator(),
            &server.bus,
            &server.registry,
            session,
            owner.id,
            pod_b.id,
        )
        .await
        .unwrap();
        assert_eq!(previous, Some(pod_a.id));

        let entry = server.registry.get(session).await.unwrap();
        assert_eq!(entry.pod_id, pod_b.id);
        assert_eq!(server.registry.count().await, 1);
    }
}
