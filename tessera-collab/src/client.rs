//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect with
//!   exponential backoff)
//! - Update send/receive, tagged with a Lamport clock
//! - Awareness (cursor/selection) messages
//! - Offline queue for updates produced while disconnected
//!
//! After the first successful [`SyncClient::connect`] a supervisor task owns
//! the socket. When the link drops it reconnects, joins again with the last
//! version vector handed to [`SyncClient::set_version_vector`], and replays
//! the offline queue in original order.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::presence::AwarenessMessage;
use crate::protocol::{JoinRequest, MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Default offline queue capacity, in updates.
pub const DEFAULT_OFFLINE_CAPACITY: usize = 10_000;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const OUTGOING_CAPACITY: usize = 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined the document; the bootstrap follows.
    Connected,
    /// Link lost; waiting before the given attempt.
    Reconnecting { attempt: u32 },
    /// Link closed for good (disconnect or retries exhausted).
    Disconnected,
    /// An update relayed from another peer
    RemoteUpdate {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// Bootstrap state (`SyncStep2`)
    StateSynced(Vec<u8>),
    /// The relay's version vector (`SyncStep1`)
    ServerVersion(Vec<u8>),
    /// Persistence outcome for one of our updates
    Acked { clock: u64, durable: bool },
    RemoteAwareness {
        peer_id: Uuid,
        message: AwarenessMessage,
    },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// The relay refused a frame or a join.
    Rejected(String),
}

/// Reconnection backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// None = retry forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn for_testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    /// Wait before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Offline queue for updates produced while disconnected.
///
/// Queued updates are replayed, oldest first, on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. False when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { clock, payload });
        true
    }

    /// Oldest queued update.
    pub fn front(&self) -> Option<(u64, &[u8])> {
        self.queue.front().map(|u| (u.clock, u.payload.as_slice()))
    }

    pub fn pop_front(&mut self) -> Option<(u64, Vec<u8>)> {
        self.queue.pop_front().map(|u| (u.clock, u.payload))
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.clock, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

/// Connection state, outgoing channel and offline queue change together.
struct Link {
    state: ConnectionState,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    offline: OfflineQueue,
}

struct ClientShared {
    peer_info: PeerInfo,
    doc_id: String,
    server_url: String,
    policy: ReconnectPolicy,
    link: Mutex<Link>,
    clock: AtomicU64,
    version_vector: std::sync::Mutex<Option<Vec<u8>>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ClientShared {
    fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.doc_id)
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn version_vector(&self) -> Option<Vec<u8>> {
        self.version_vector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The sync client.
pub struct SyncClient {
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    stop: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, doc_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self::with_policy(peer_info, doc_id, server_url, ReconnectPolicy::default())
    }

    pub fn with_policy(
        peer_info: PeerInfo,
        doc_id: impl Into<String>,
        server_url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(ClientShared {
                peer_info,
                doc_id: doc_id.into(),
                server_url: server_url.into(),
                policy,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    outgoing: None,
                    offline: OfflineQueue::new(DEFAULT_OFFLINE_CAPACITY),
                }),
                clock: AtomicU64::new(0),
                version_vector: std::sync::Mutex::new(None),
                event_tx,
            }),
            event_rx: Some(event_rx),
            stop,
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to `<server_url>/<doc_id>`.
    ///
    /// The first attempt is made here and its failure returned; after that
    /// a background task keeps the link alive until [`SyncClient::disconnect`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.supervisor.as_ref().is_some_and(|s| !s.is_finished()) {
            return Ok(());
        }

        self.shared.link.lock().await.state = ConnectionState::Connecting;
        let ws = match tokio_tungstenite::connect_async(self.shared.url()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.shared.link.lock().await.state = ConnectionState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
        };
        log::info!("Connected to {}", self.shared.url());

        self.stop.send_replace(false);
        let shared = self.shared.clone();
        let stop = self.stop.subscribe();
        self.supervisor = Some(tokio::spawn(supervise(shared, ws, stop)));
        Ok(())
    }

    /// Close the link and stop reconnecting. Idempotent.
    pub async fn disconnect(&mut self) {
        self.stop.send_replace(true);
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                log::warn!("Client supervisor failed: {e}");
            }
        }
        self.shared.link.lock().await.state = ConnectionState::Disconnected;
    }

    /// Send an update, or queue it while the link is down.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<u64, ProtocolError> {
        let clock = self.shared.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let mut link = self.shared.link.lock().await;

        if let Some(tx) = &link.outgoing {
            let frame = SyncMessage::update(
                self.shared.peer_info.peer_id,
                self.shared.doc_id.as_str(),
                clock,
                update.clone(),
            )
            .encode()?;
            if tx.send(frame).await.is_ok() {
                return Ok(clock);
            }
        }

        if !link.offline.enqueue(clock, update) {
            return Err(ProtocolError::QueueFull(link.offline.capacity()));
        }
        Ok(clock)
    }

    /// Send an awareness message. Dropped while offline.
    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), ProtocolError> {
        let link = self.shared.link.lock().await;
        let Some(tx) = &link.outgoing else {
            return Ok(());
        };

        let clock = self.shared.clock.load(Ordering::SeqCst);
        let frame = SyncMessage::awareness(
            self.shared.peer_info.peer_id,
            self.shared.doc_id.as_str(),
            clock,
            message,
        )?
        .encode()?;
        tx.send(frame).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send our current version vector; the relay answers with a diff.
    pub async fn request_sync(&self, version_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let link = self.shared.link.lock().await;
        let tx = link.outgoing.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let frame = SyncMessage::sync_step1(
            self.shared.peer_info.peer_id,
            self.shared.doc_id.as_str(),
            version_vector,
        )
        .encode()?;
        tx.send(frame).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Version vector sent with the next (re)join.
    pub fn set_version_vector(&self, version_vector: Vec<u8>) {
        *self
            .shared
            .version_vector
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version_vector);
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.link.lock().await.state
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.shared.peer_info
    }

    pub fn doc_id(&self) -> &str {
        &self.shared.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.shared.server_url
    }

    /// Current Lamport clock value.
    pub fn clock(&self) -> u64 {
        self.shared.clock.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.link.lock().await.offline.len()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

// ─── Supervisor ───────────────────────────────────────────────────────

enum LinkEnd {
    Stopped,
    Lost,
}

async fn supervise(shared: Arc<ClientShared>, first: WsStream, mut stop: watch::Receiver<bool>) {
    let mut ws = first;

    loop {
        if let LinkEnd::Stopped = run_link(&shared, ws, &mut stop).await {
            break;
        }

        let mut attempt = 0;
        let reconnected = loop {
            attempt += 1;
            if shared.policy.exhausted(attempt) {
                log::warn!("Giving up on {} after {} attempts", shared.url(), attempt - 1);
                break None;
            }
            shared.emit(SyncEvent::Reconnecting { attempt });

            tokio::select! {
                _ = tokio::time::sleep(shared.policy.delay(attempt)) => {}
                _ = stop.wait_for(|s| *s) => break None,
            }

            match tokio_tungstenite::connect_async(shared.url()).await {
                Ok((ws, _)) => {
                    log::info!("Reconnected to {} (attempt {attempt})", shared.url());
                    break Some(ws);
                }
                Err(e) => log::debug!("Reconnect attempt {attempt} failed: {e}"),
            }
        };

        match reconnected {
            Some(next) => ws = next,
            None => break,
        }
    }

    shared.link.lock().await.state = ConnectionState::Disconnected;
    shared.emit(SyncEvent::Disconnected);
}

/// Join, replay the offline queue, then pump frames until the link ends.
async fn run_link(shared: &ClientShared, ws: WsStream, stop: &mut watch::Receiver<bool>) -> LinkEnd {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);

    {
        let mut link = shared.link.lock().await;
        if let Err(e) = join(shared, &mut sink, &mut link.offline).await {
            log::warn!("Join of {} failed: {e}", shared.doc_id);
            link.state = ConnectionState::Reconnecting;
            return LinkEnd::Lost;
        }
        link.outgoing = Some(out_tx.clone());
        link.state = ConnectionState::Connected;
    }
    shared.emit(SyncEvent::Connected);

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    let end = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => handle_frame(shared, &data, &out_tx),
                Some(Ok(Message::Close(_))) | None => break LinkEnd::Lost,
                Some(Err(e)) => {
                    log::warn!("WebSocket error on {}: {e}", shared.doc_id);
                    break LinkEnd::Lost;
                }
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => {
                if let Ok(ping) = SyncMessage::ping(shared.peer_info.peer_id).encode() {
                    let _ = out_tx.try_send(ping);
                }
            }
            _ = stop.wait_for(|s| *s) => break LinkEnd::Stopped,
        }
    };

    {
        let mut link = shared.link.lock().await;
        link.outgoing = None;
        link.state = match end {
            LinkEnd::Stopped => ConnectionState::Disconnected,
            LinkEnd::Lost => ConnectionState::Reconnecting,
        };
    }
    drop(out_tx);
    if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
        log::debug!("Writer for {} did not close in time", shared.doc_id);
    }
    if let LinkEnd::Lost = end {
        log::info!("Link to {} lost", shared.url());
    }
    end
}

/// Send the join (with our version vector), then the offline queue in order.
/// An update leaves the queue only once it is on the wire.
async fn join<S>(shared: &ClientShared, sink: &mut S, offline: &mut OfflineQueue) -> Result<(), ProtocolError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let request = JoinRequest {
        peer: shared.peer_info.clone(),
        version_vector: shared.version_vector(),
    };
    let join = SyncMessage::join(shared.doc_id.as_str(), &request)?.encode()?;
    sink.send(Message::Binary(join.into()))
        .await
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;

    if !offline.is_empty() {
        log::info!("Replaying {} queued updates", offline.len());
    }
    while let Some((clock, payload)) = offline.front() {
        let frame = SyncMessage::update(
            shared.peer_info.peer_id,
            shared.doc_id.as_str(),
            clock,
            payload.to_vec(),
        )
        .encode()?;
        sink.send(Message::Binary(frame.into()))
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        offline.pop_front();
    }
    Ok(())
}

fn handle_frame(shared: &ClientShared, bytes: &[u8], out_tx: &mpsc::Sender<Vec<u8>>) {
    let msg = match SyncMessage::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Undecodable frame on {}: {e}", shared.doc_id);
            return;
        }
    };
    let own_id = shared.peer_info.peer_id;

    let event = match msg.msg_type {
        MessageType::Update if msg.peer_id == own_id => None,
        MessageType::Update => Some(SyncEvent::RemoteUpdate {
            peer_id: msg.peer_id,
            clock: msg.clock,
            update: msg.payload,
        }),
        MessageType::SyncStep2 => Some(SyncEvent::StateSynced(msg.payload)),
        MessageType::SyncStep1 => Some(SyncEvent::ServerVersion(msg.payload)),
        MessageType::Ack => msg
            .ack_payload()
            .map(|ack| SyncEvent::Acked {
                clock: ack.clock,
                durable: ack.durable,
            })
            .ok(),
        MessageType::Awareness if msg.peer_id == own_id => None,
        MessageType::Awareness => msg
            .awareness_message()
            .map(|message| SyncEvent::RemoteAwareness {
                peer_id: msg.peer_id,
                message,
            })
            .ok(),
        MessageType::PeerJoined => msg
            .join_request()
            .ok()
            .filter(|r| r.peer.peer_id != own_id)
            .map(|r| SyncEvent::PeerJoined(r.peer)),
        MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
        MessageType::Error => msg.error_reason().ok().map(SyncEvent::Rejected),
        MessageType::Ping => {
            if let Ok(pong) = SyncMessage::pong(own_id).encode() {
                let _ = out_tx.try_send(pong);
            }
            None
        }
        MessageType::Pong => None,
    };

    if let Some(event) = event {
        shared.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(PeerInfo::new("TestUser"), "doc-1", "ws://localhost:9")
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.doc_id(), "doc-1");
        assert_eq!(client.server_url(), "ws://localhost:9");
        assert_eq!(client.shared.url(), "ws://localhost:9/doc-1");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.clock(), 0);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = client();
        assert_eq!(client.send_update(vec![1, 2, 3]).await.unwrap(), 1);
        assert_eq!(client.send_update(vec![4, 5, 6]).await.unwrap(), 2);
        assert_eq!(client.offline_queue_len().await, 2);
        assert_eq!(client.clock(), 2);
    }

    #[tokio::test]
    async fn test_send_awareness_offline_noop() {
        let client = client();
        let msg = AwarenessMessage::Leave {
            user_id: client.peer_info().peer_id,
        };
        client.send_awareness(&msg).await.unwrap();
        assert!(client.request_sync(vec![0]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Port 9 (discard) is not listening in test environments.
        let mut client = client();
        assert!(matches!(client.connect().await, Err(ProtocolError::Transport(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        client.disconnect().await;
        client.disconnect().await;
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(1, vec![1, 2, 3]);
        queue.enqueue(2, vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);
        assert_eq!(queue.front(), Some((1, &[1u8, 2, 3][..])));

        assert_eq!(queue.pop_front(), Some((1, vec![1, 2, 3])));
        let drained = queue.drain();
        assert_eq!(drained, vec![(2, vec![4, 5, 6, 7])]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2]));
        assert!(queue.enqueue(3, vec![3]));
        assert!(!queue.enqueue(4, vec![4]));
        assert_eq!(queue.len(), 3);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reconnect_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(30), Duration::from_secs(10));
        assert!(!policy.exhausted(1_000));

        let bounded = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::default()
        };
        assert!(!bounded.exhausted(3));
        assert!(bounded.exhausted(4));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
