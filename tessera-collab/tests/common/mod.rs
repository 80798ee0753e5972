//! Shared harness for the integration tests: an in-process relay on an
//! ephemeral port and a bare WebSocket peer that speaks the wire protocol.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tessera_collab::{
    JoinRequest, MemoryStore, MessageType, PeerInfo, PersistedDocument, Persistence, ServerConfig,
    StoreError, SyncMessage, SyncServer,
};
use tessera_core::{DiagramDoc, Geometry, Node, Operation};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A relay serving on `127.0.0.1` until [`TestServer::stop`].
pub struct TestServer {
    pub server: Arc<SyncServer>,
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let server = SyncServer::new(config).unwrap();
        Self::launch(server, "127.0.0.1:0").await
    }

    pub async fn with_store(config: ServerConfig, store: Arc<dyn Persistence>) -> Self {
        let server = SyncServer::with_store(config, store).unwrap();
        Self::launch(server, "127.0.0.1:0").await
    }

    /// Serve `store` on a fixed address, e.g. to bring a relay back up
    /// where a previous one listened.
    pub async fn restart_on(addr: SocketAddr, store: Arc<dyn Persistence>) -> Self {
        let server = SyncServer::with_store(ServerConfig::for_testing(), store).unwrap();
        Self::launch(server, &addr.to_string()).await
    }

    async fn launch(server: SyncServer, bind: &str) -> Self {
        let listener = TcpListener::bind(bind).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);
        let (stop, stopped) = oneshot::channel::<()>();

        let serving = server.clone();
        let task = tokio::spawn(async move {
            serving
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self {
            server,
            addr,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Shut the relay down and wait until its store is flushed.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            timeout(RECV_TIMEOUT, task).await.unwrap().unwrap();
        }
    }
}

/// A store whose disk is gone: every append fails, everything else is
/// served from memory.
pub struct FailingStore {
    inner: MemoryStore,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
        }
    }
}

impl Persistence for FailingStore {
    fn load(&self, doc_id: &str) -> Result<PersistedDocument, StoreError> {
        self.inner.load(doc_id)
    }

    fn append(&self, doc_id: &str, _update: &[u8]) -> Result<u64, StoreError> {
        Err(StoreError::Database(format!("no space left for {doc_id}")))
    }

    fn compact(&self, doc_id: &str) -> Result<u64, StoreError> {
        self.inner.compact(doc_id)
    }

    fn pending_updates(&self, doc_id: &str) -> Result<u64, StoreError> {
        self.inner.pending_updates(doc_id)
    }

    fn list_documents(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_documents(prefix)
    }

    fn delete_document(&self, doc_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_document(doc_id)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush()
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A peer driving the relay frame by frame.
pub struct RawPeer {
    pub info: PeerInfo,
    pub doc_id: String,
    ws: Socket,
    clock: u64,
}

impl RawPeer {
    /// Open `<url>/<doc_id>` without joining.
    pub async fn connect(url: &str, doc_id: &str, name: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("{url}/{doc_id}"))
            .await
            .unwrap();
        Self {
            info: PeerInfo::new(name),
            doc_id: doc_id.to_string(),
            ws,
            clock: 0,
        }
    }

    /// Connect and join, optionally asking for a diff against `version_vector`.
    pub async fn join(url: &str, doc_id: &str, name: &str, version_vector: Option<Vec<u8>>) -> Self {
        let mut peer = Self::connect(url, doc_id, name).await;
        let request = JoinRequest {
            peer: peer.info.clone(),
            version_vector,
        };
        let join = SyncMessage::join(doc_id, &request).unwrap();
        peer.send(&join).await;
        peer
    }

    pub async fn send(&mut self, msg: &SyncMessage) {
        self.send_raw(msg.encode().unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Send an update; returns the clock it carried.
    pub async fn send_update(&mut self, update: Vec<u8>) -> u64 {
        self.clock += 1;
        let msg = SyncMessage::update(self.info.peer_id, self.doc_id.as_str(), self.clock, update);
        self.send(&msg).await;
        self.clock
    }

    /// Next protocol frame, relay pings excluded. `None` on timeout or close.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<SyncMessage> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    let msg = SyncMessage::decode(&data).unwrap();
                    if msg.msg_type != MessageType::Ping {
                        return Some(msg);
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) | Err(_) => return None,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Skip frames until one of type `msg_type` arrives.
    pub async fn expect(&mut self, msg_type: MessageType) -> SyncMessage {
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_within(remaining).await {
                Some(msg) if msg.msg_type == msg_type => return msg,
                Some(_) => {}
                None => panic!("no {msg_type:?} frame within {RECV_TIMEOUT:?}"),
            }
        }
    }

    /// Assert that no frame of type `msg_type` arrives for `wait`.
    pub async fn expect_none(&mut self, msg_type: MessageType, wait: Duration) {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_within(remaining).await {
                Some(msg) if msg.msg_type == msg_type => panic!("unexpected {msg_type:?} frame: {msg:?}"),
                Some(_) => {}
                None => return,
            }
        }
    }

    /// Consume the join bootstrap and return the `SyncStep2` payload.
    pub async fn bootstrap(&mut self) -> Vec<u8> {
        let step2 = self.expect(MessageType::SyncStep2).await;
        self.expect(MessageType::SyncStep1).await;
        step2.payload
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub fn box_node(id: &str) -> Node {
    Node::with_id(id, "box", Geometry::new(0.0, 0.0, 100.0, 50.0))
}

/// Add a node to `doc` and return the update bytes.
pub fn put_node(doc: &mut DiagramDoc, id: &str) -> Vec<u8> {
    doc.apply_local_operation(Operation::PutNode(box_node(id)))
        .unwrap()
        .into_bytes()
}

/// Poll `check` every 20ms until it holds or `RECV_TIMEOUT` passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + RECV_TIMEOUT;
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
