//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! ws://host:port/<doc_id>
//!
//! Client A ──┐                       ┌──► Client B
//!             ├── Room (doc_id) ──────┤
//! Client C ──┘   BroadcastGroup      └──► Client C
//!                     │
//!                     │ append (before broadcast), load, compact
//!                     ▼
//!             PersistenceHandle ──► worker thread ──► DocumentStore
//! ```
//!
//! The relay never interprets document content: it validates that an update
//! decodes, queues it for persistence, and forwards the frame unchanged to
//! every other connection in the room. Bootstrap state is served from the
//! store through the same FIFO worker, so a joiner cannot miss an update
//! that was broadcast before it subscribed.
//!
//! Connection states: `Connecting → Joined(room) → Closed`.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use tessera_core::codec::{self, Update, VersionVector};

use crate::broadcast::{BroadcastGroup, Frame, RoomManager};
use crate::compaction::{spawn_compactor, CompactionConfig};
use crate::persistence::{AppendReceipt, PersistenceHandle};
use crate::presence::AwarenessMessage;
use crate::protocol::{AckPayload, JoinRequest, MessageType, PeerInfo, SyncMessage};
use crate::storage::{
    validate_document_id, DocumentStore, MemoryStore, Persistence, StoreConfig, StoreError,
};

/// Peer id the relay stamps on the frames it originates.
pub const SERVER_PEER_ID: Uuid = Uuid::nil();

/// Silent heartbeat intervals before a connection is dropped.
const MISSED_HEARTBEATS: u32 = 3;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// fsync every append before acknowledging it
    pub sync_writes: bool,
    pub compaction: CompactionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            sync_writes: false,
            compaction: CompactionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory store, fast compaction.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval_secs: 5,
            compaction: CompactionConfig::for_testing(),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_updates: u64,
    pub persist_failures: u64,
    pub compactions: u64,
    /// Frames dropped for failing to decode or arriving out of place.
    pub rejected_frames: u64,
    /// Full-state resends to peers that fell behind the room channel.
    pub lag_resyncs: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    persisted_updates: AtomicU64,
    persist_failures: AtomicU64,
    compactions: AtomicU64,
    rejected_frames: AtomicU64,
    lag_resyncs: AtomicU64,
}

impl AtomicServerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by the accept loop and every connection task.
struct Shared {
    config: ServerConfig,
    rooms: RoomManager,
    persistence: PersistenceHandle,
    stats: AtomicServerStats,
    shutdown: watch::Sender<bool>,
}

/// The relay server. Single use: once [`SyncServer::serve`] returns, the
/// persistence worker has stopped.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Open the configured store and start the persistence worker.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn Persistence> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    sync_writes: config.sync_writes,
                    ..StoreConfig::at(path)
                };
                Arc::new(DocumentStore::open(store_config)?)
            }
            None => {
                log::info!("No storage path configured, documents are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store)
    }

    /// Serve documents from an already opened store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn Persistence>) -> Result<Self, StoreError> {
        let persistence = PersistenceHandle::spawn(store)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                rooms: RoomManager::new(config.broadcast_capacity),
                config,
                persistence,
                stats: AtomicServerStats::default(),
                shutdown,
            }),
        })
    }

    /// Serve on the configured address until the process ends.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve on the configured address until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then close
    /// every connection, drain the persistence worker and flush the store.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let compactor = spawn_compactor(
            self.shared.persistence.clone(),
            self.shared.config.compaction.clone(),
            self.shared.shutdown.subscribe(),
        );

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let shared = self.shared.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(shared, stream, addr).await {
                                log::warn!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::error!("Accept failed: {e}"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => break,
            }
        }

        log::info!("Sync server shutting down");
        drop(listener);
        self.shared.shutdown.send_replace(true);
        while connections.join_next().await.is_some() {}
        if let Err(e) = compactor.await {
            log::warn!("Compactor task failed: {e}");
        }
        self.shared.persistence.shutdown().await?;
        log::info!("Sync server stopped");
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        let s = &self.shared.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.shared.rooms.room_count().await,
            persisted_updates: s.persisted_updates.load(Ordering::Relaxed),
            persist_failures: s.persist_failures.load(Ordering::Relaxed),
            compactions: s.compactions.load(Ordering::Relaxed),
            rejected_frames: s.rejected_frames.load(Ordering::Relaxed),
            lag_resyncs: s.lag_resyncs.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.shared.rooms
    }

    pub fn persistence(&self) -> &PersistenceHandle {
        &self.shared.persistence
    }
}

// ─── Connections ──────────────────────────────────────────────────────

struct Joined {
    peer: PeerInfo,
    room: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Frame>,
}

type ReceiptSender = mpsc::UnboundedSender<(u64, Result<AppendReceipt, StoreError>)>;

/// Per-connection state.
struct Connection {
    shared: Arc<Shared>,
    conn_id: Uuid,
    doc_id: String,
    addr: SocketAddr,
    joined: Option<Joined>,
    receipts: ReceiptSender,
}

/// Document id from the request path, `/<doc_id>`.
fn document_id_from_path(path: &str) -> Result<String, StoreError> {
    let doc_id = path.trim_start_matches('/');
    validate_document_id(doc_id)?;
    Ok(doc_id.to_owned())
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
    let mut doc_id = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match document_id_from_path(req.uri().path()) {
            Ok(id) => {
                doc_id = id;
                Ok(resp)
            }
            Err(e) => {
                let mut reject = ErrorResponse::new(Some(e.to_string()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                Err(reject)
            }
        }
    })
    .await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    log::info!("WebSocket connection from {addr} for document {doc_id}");
    AtomicServerStats::bump(&shared.stats.total_connections);
    AtomicServerStats::bump(&shared.stats.active_connections);

    let (receipts, mut acks) = spawn_ack_forwarder(shared.clone());
    let mut conn = Connection {
        shared: shared.clone(),
        conn_id: Uuid::new_v4(),
        doc_id,
        addr,
        joined: None,
        receipts,
    };

    let result = conn.run(&mut ws_tx, &mut ws_rx, &mut acks).await;
    conn.close().await;
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

/// Resolves append receipts in submission order and turns them into acks.
fn spawn_ack_forwarder(shared: Arc<Shared>) -> (ReceiptSender, mpsc::UnboundedReceiver<AckPayload>) {
    let (receipt_tx, mut receipt_rx) = mpsc::unbounded_channel::<(u64, Result<AppendReceipt, StoreError>)>();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some((clock, receipt)) = receipt_rx.recv().await {
            let outcome = match receipt {
                Ok(receipt) => receipt.wait().await,
                Err(e) => Err(e),
            };
            let durable = match outcome {
                Ok(_) => {
                    AtomicServerStats::bump(&shared.stats.persisted_updates);
                    true
                }
                Err(e) => {
                    log::error!("Update with clock {clock} was not persisted: {e}");
                    AtomicServerStats::bump(&shared.stats.persist_failures);
                    false
                }
            };
            if ack_tx.send(AckPayload { clock, durable }).is_err() {
                break;
            }
        }
    });

    (receipt_tx, ack_rx)
}

async fn next_frame(joined: &mut Option<Joined>) -> Result<Frame, broadcast::error::RecvError> {
    match joined {
        Some(joined) => joined.rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send(ws_tx: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    ws_tx.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

impl Connection {
    async fn run<S>(
        &mut self,
        ws_tx: &mut WsSink,
        ws_rx: &mut S,
        acks: &mut mpsc::UnboundedReceiver<AckPayload>,
    ) -> Result<(), BoxError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let heartbeat_period = Duration::from_secs(self.shared.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        let mut last_seen = Instant::now();
        let mut shutdown = self.shared.shutdown.subscribe();

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            for reply in self.handle_frame(&data).await {
                                send(ws_tx, &reply).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_tx.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                frame = next_frame(&mut self.joined) => match frame {
                    Ok(frame) if frame.origin == self.conn_id => {}
                    Ok(frame) => {
                        ws_tx.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {} lagged by {n} frames", self.conn_id);
                        if let Some(joined) = &self.joined {
                            joined.room.record_dropped(n);
                        }
                        // The skipped frames are gone; resend the stored state.
                        match self.bootstrap(None).await {
                            Ok((state, server_vv)) => {
                                AtomicServerStats::bump(&self.shared.stats.lag_resyncs);
                                send(ws_tx, &state).await?;
                                send(ws_tx, &server_vv).await?;
                            }
                            Err(e) => {
                                log::error!("Failed to resync lagging connection {}: {e}", self.conn_id);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                Some(ack) = acks.recv() => {
                    let msg = SyncMessage::ack(SERVER_PEER_ID, self.doc_id.as_str(), ack)?;
                    send(ws_tx, &msg).await?;
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > heartbeat_period * MISSED_HEARTBEATS {
                        log::info!("Connection {} timed out", self.addr);
                        break;
                    }
                    send(ws_tx, &SyncMessage::ping(SERVER_PEER_ID)).await?;
                }

                _ = shutdown.wait_for(|stop| *stop) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Process one inbound frame; returns the frames to send back.
    async fn handle_frame(&mut self, bytes: &[u8]) -> Vec<SyncMessage> {
        let shared = self.shared.clone();
        let stats = &shared.stats;
        stats.total_messages.fetch_add(1, Ordering::Relaxed);
        stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode frame from {}: {e}", self.addr);
                AtomicServerStats::bump(&stats.rejected_frames);
                return Vec::new();
            }
        };
        log::trace!("{:?} from {} ({} bytes)", msg.msg_type, self.addr, bytes.len());

        if !msg.doc_id.is_empty() && msg.doc_id != self.doc_id {
            AtomicServerStats::bump(&stats.rejected_frames);
            log::warn!(
                "Frame for {} on a connection to {}, rejected",
                msg.doc_id,
                self.doc_id
            );
            return vec![self.error(&format!(
                "connection belongs to document {}",
                self.doc_id
            ))];
        }

        match msg.msg_type {
            MessageType::PeerJoined => match msg.join_request() {
                Ok(request) if self.joined.is_none() => self.join(request).await,
                Ok(_) => Vec::new(),
                Err(e) => {
                    AtomicServerStats::bump(&stats.rejected_frames);
                    vec![self.error(&e.to_string())]
                }
            },

            MessageType::SyncStep1 if self.joined.is_none() => {
                let request = JoinRequest {
                    peer: PeerInfo::with_id(msg.peer_id, "anonymous"),
                    version_vector: Some(msg.payload),
                };
                self.join(request).await
            }

            MessageType::SyncStep1 => match self.bootstrap(Some(msg.payload.as_slice())).await {
                Ok((step2, _)) => vec![step2],
                Err(e) => vec![self.error(&e.to_string())],
            },

            MessageType::Update => self.relay_update(msg, bytes),

            MessageType::Awareness => {
                if let Some(joined) = &self.joined {
                    log_awareness(&msg, &self.doc_id);
                    joined.room.broadcast_raw(Frame {
                        origin: self.conn_id,
                        bytes: Arc::new(bytes.to_vec()),
                    });
                }
                Vec::new()
            }

            MessageType::Ping => vec![SyncMessage::pong(SERVER_PEER_ID)],
            MessageType::Pong => Vec::new(),

            other => {
                log::debug!("Unhandled message type from {}: {other:?}", self.addr);
                Vec::new()
            }
        }
    }

    /// `Connecting → Joined`: subscribe to the room, then serve the bootstrap.
    async fn join(&mut self, request: JoinRequest) -> Vec<SyncMessage> {
        let shared = self.shared.clone();
        let (room, rx) = match shared
            .rooms
            .join(&self.doc_id, self.conn_id, request.peer.clone(), shared.config.max_peers_per_room)
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Join of {} to {} refused: {e}", request.peer.name, self.doc_id);
                return vec![self.error(&e.to_string())];
            }
        };

        // Subscribed first: every update broadcast from here on arrives on
        // `rx`, everything appended earlier is in the load.
        let (step2, step1) = match self.bootstrap(request.version_vector.as_deref()).await {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("Bootstrap of {} failed: {e}", self.doc_id);
                shared.rooms.leave(&self.doc_id, &self.conn_id).await;
                return vec![self.error("document unavailable")];
            }
        };

        let mut replies = vec![step2, step1];
        for peer in room.peers().await {
            if peer.peer_id == request.peer.peer_id {
                continue;
            }
            let existing = JoinRequest {
                peer,
                version_vector: None,
            };
            if let Ok(frame) = SyncMessage::join(self.doc_id.as_str(), &existing) {
                replies.push(frame);
            }
        }

        let announce = JoinRequest {
            peer: request.peer.clone(),
            version_vector: None,
        };
        match SyncMessage::join(self.doc_id.as_str(), &announce) {
            Ok(frame) => {
                let _ = room.broadcast(self.conn_id, &frame);
            }
            Err(e) => log::warn!("Failed to announce {}: {e}", request.peer.name),
        }

        log::info!(
            "Peer {} ({}) joined document {}",
            request.peer.name,
            request.peer.peer_id,
            self.doc_id
        );
        self.joined = Some(Joined {
            peer: request.peer,
            room,
            rx,
        });
        replies
    }

    /// `SyncStep2` (full state, or a diff against `since`) and the relay's
    /// own `SyncStep1`.
    async fn bootstrap(&self, since: Option<&[u8]>) -> Result<(SyncMessage, SyncMessage), StoreError> {
        let record = self.shared.persistence.load(&self.doc_id).await?;
        let state = record.state()?;

        let payload = match since.map(VersionVector::decode) {
            Some(Ok(vv)) => codec::diff(&state, &vv)?,
            Some(Err(e)) => {
                log::debug!("Unreadable version vector from {}, sending full state: {e}", self.addr);
                state.clone()
            }
            None => state.clone(),
        };
        let server_vv = codec::version_vector_of(&state)?;

        Ok((
            SyncMessage::sync_step2(SERVER_PEER_ID, self.doc_id.as_str(), payload.into_bytes()),
            SyncMessage::sync_step1(SERVER_PEER_ID, self.doc_id.as_str(), server_vv.encode()),
        ))
    }

    /// Queue the append, then fan the original frame out.
    fn relay_update(&self, msg: SyncMessage, bytes: &[u8]) -> Vec<SyncMessage> {
        let Some(joined) = &self.joined else {
            AtomicServerStats::bump(&self.shared.stats.rejected_frames);
            return vec![self.error("join a document before sending updates")];
        };

        let update = Update::from_bytes(msg.payload);
        if let Err(e) = update.validate() {
            log::warn!("Dropping malformed update from {}: {e}", self.addr);
            AtomicServerStats::bump(&self.shared.stats.rejected_frames);
            return Vec::new();
        }

        let receipt = self.shared.persistence.append(&self.doc_id, update.into_bytes());
        if self.receipts.send((msg.clock, receipt)).is_err() {
            log::warn!("Ack forwarder for {} is gone", self.addr);
        }

        let receivers = joined.room.broadcast_raw(Frame {
            origin: self.conn_id,
            bytes: Arc::new(bytes.to_vec()),
        });
        log::trace!("Relayed update {} to {} receivers", msg.clock, receivers.saturating_sub(1));
        Vec::new()
    }

    fn error(&self, reason: &str) -> SyncMessage {
        SyncMessage::error(SERVER_PEER_ID, self.doc_id.as_str(), reason)
    }

    /// `Joined → Closed`: leave the room, tell the others, compact on last leave.
    async fn close(&mut self) {
        let Some(joined) = self.joined.take() else {
            return;
        };
        drop(joined.rx);

        let departure = self.shared.rooms.leave(&self.doc_id, &self.conn_id).await;
        log::info!(
            "Peer {} left document {}",
            joined.peer.name,
            self.doc_id
        );

        if !departure.room_closed {
            let _ = joined.room.broadcast(
                self.conn_id,
                &SyncMessage::peer_left(joined.peer.peer_id, self.doc_id.as_str()),
            );
            return;
        }

        let shared = self.shared.clone();
        let doc_id = self.doc_id.clone();
        tokio::spawn(async move {
            match shared.persistence.compact(&doc_id).await {
                Ok(0) => {}
                Ok(folded) => {
                    AtomicServerStats::bump(&shared.stats.compactions);
                    log::info!("Compacted {folded} updates of {doc_id} (room closed)");
                }
                Err(StoreError::WorkerStopped) => {}
                Err(e) => log::error!("Compaction of {doc_id} failed: {e}"),
            }
        });
    }
}

fn log_awareness(msg: &SyncMessage, doc_id: &str) {
    match msg.awareness_message() {
        Ok(AwarenessMessage::Join { user_name, .. }) => {
            log::info!("Presence: {user_name} joined room {doc_id}");
        }
        Ok(AwarenessMessage::Leave { user_id }) => {
            log::info!("Presence: {user_id} left room {doc_id}");
        }
        Ok(AwarenessMessage::Cursor { .. }) => {
            log::trace!("Presence: cursor update in room {doc_id}");
        }
        Ok(AwarenessMessage::Selection { user_id, node_ids, edge_ids }) => {
            log::debug!(
                "Presence: {user_id} selected {} nodes and {} edges in room {doc_id}",
                node_ids.len(),
                edge_ids.len()
            );
        }
        Err(e) => log::debug!("Undecodable awareness payload in room {doc_id}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_document_id_from_path() {
        assert_eq!(document_id_from_path("/diagram-1").unwrap(), "diagram-1");
        assert!(document_id_from_path("/").is_err());
        assert!(document_id_from_path("/a/b").is_err());
    }

    #[tokio::test]
    async fn test_server_creation_in_memory() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
        assert_eq!(server.stats().await, ServerStats::default());
        assert!(server.persistence().is_running());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.persistence().list_documents("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), server.serve(listener, async {}))
            .await
            .unwrap()
            .unwrap();
        assert!(!server.persistence().is_running());
    }
}
