//! Room fan-out with backpressure.
//!
//! Each document room owns one tokio broadcast channel. A frame is sent once
//! and every connection's receiver gets the same `Arc`; receivers drop the
//! frames they originated themselves. A receiver that falls more than
//! `capacity` frames behind lags and loses the oldest frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// One encoded frame and the connection that produced it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic counters, so the send path never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    /// Connection id → peer identity.
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    async fn add_peer(&self, conn_id: Uuid, info: PeerInfo) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        peers.insert(conn_id, info);
        self.sender.subscribe()
    }

    async fn remove_peer(&self, conn_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(conn_id)
    }

    /// Encode `msg` once and send it to every receiver in the room.
    ///
    /// Returns the number of receivers, the originator's included; filtering
    /// by [`Frame::origin`] is the receiver's job.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(Frame { origin, bytes }))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_connection(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Outcome of [`RoomManager::leave`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Departure {
    pub peer: Option<PeerInfo>,
    /// The connection was the room's last; the room is gone.
    pub room_closed: bool,
}

/// Maps document ids to broadcast groups.
///
/// Rooms are created by the first join and removed by the last leave. Both
/// happen under the map's write lock, so a join can never land in a room
/// that is being torn down.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add a connection to the room for `doc_id`, creating the room if needed.
    pub async fn join(
        &self,
        doc_id: &str,
        conn_id: Uuid,
        info: PeerInfo,
        max_peers: usize,
    ) -> Result<(Arc<BroadcastGroup>, broadcast::Receiver<Frame>), ProtocolError> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(doc_id) {
            Some(room) => room.clone(),
            None => {
                log::info!("Room created for document {doc_id}");
                let room = Arc::new(BroadcastGroup::new(self.default_capacity));
                rooms.insert(doc_id.to_owned(), room.clone());
                room
            }
        };

        if room.peer_count().await >= max_peers {
            return Err(ProtocolError::Rejected(format!(
                "room {doc_id} is full ({max_peers} peers)"
            )));
        }

        let rx = room.add_peer(conn_id, info).await;
        Ok((room, rx))
    }

    /// Remove a connection; tears the room down when it was the last one.
    pub async fn leave(&self, doc_id: &str, conn_id: &Uuid) -> Departure {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(doc_id).cloned() else {
            return Departure::default();
        };

        let peer = room.remove_peer(conn_id).await;
        let room_closed = room.peer_count().await == 0;
        if room_closed {
            rooms.remove(doc_id);
            log::info!("Room closed for document {doc_id}");
        }
        Departure { peer, room_closed }
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn join(manager: &RoomManager, doc: &str, name: &str) -> (Uuid, Arc<BroadcastGroup>, broadcast::Receiver<Frame>) {
        let conn = Uuid::new_v4();
        let (room, rx) = manager.join(doc, conn, PeerInfo::new(name), 8).await.unwrap();
        (conn, room, rx)
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_receiver() {
        let manager = RoomManager::new(16);
        let (alice, room, mut rx1) = join(&manager, "d1", "Alice").await;
        let (_, _, mut rx2) = join(&manager, "d1", "Bob").await;
        let (_, _, mut rx3) = join(&manager, "d1", "Charlie").await;

        let msg = SyncMessage::update(Uuid::new_v4(), "d1", 1, vec![1, 2, 3]);
        assert_eq!(room.broadcast(alice, &msg).unwrap(), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.origin, alice);
            assert_eq!(SyncMessage::decode(&frame.bytes).unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let manager = RoomManager::new(16);
        let (a, room1, _rx1) = join(&manager, "d1", "Alice").await;
        let (_, room2, mut rx2) = join(&manager, "d2", "Bob").await;

        assert!(!Arc::ptr_eq(&room1, &room2));
        room1.broadcast(a, &SyncMessage::ping(a)).unwrap();
        assert!(rx2.try_recv().is_err());

        let mut docs = manager.active_documents().await;
        docs.sort();
        assert_eq!(docs, vec!["d1".to_string(), "d2".to_string()]);
    }

    #[tokio::test]
    async fn test_last_leave_closes_room() {
        let manager = RoomManager::new(16);
        let (a, _, _rx1) = join(&manager, "d1", "Alice").await;
        let (b, _, _rx2) = join(&manager, "d1", "Bob").await;

        let first = manager.leave("d1", &a).await;
        assert_eq!(first.peer.unwrap().name, "Alice");
        assert!(!first.room_closed);
        assert_eq!(manager.room_count().await, 1);

        assert!(manager.leave("d1", &b).await.room_closed);
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(manager.leave("d1", &b).await, Departure::default());
    }

    #[tokio::test]
    async fn test_full_room_rejects() {
        let manager = RoomManager::new(16);
        manager.join("d1", Uuid::new_v4(), PeerInfo::new("a"), 1).await.unwrap();
        let err = manager
            .join("d1", Uuid::new_v4(), PeerInfo::new("b"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let manager = RoomManager::new(16);
        let (a, room, _rx) = join(&manager, "d1", "Alice").await;

        room.broadcast(a, &SyncMessage::ping(a)).unwrap();
        room.broadcast(a, &SyncMessage::ping(a)).unwrap();
        room.record_dropped(3);

        let stats = room.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
        assert!(room.has_connection(&a).await);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let origin = Uuid::new_v4();
        let mut rx = group.add_peer(origin, PeerInfo::new("slow")).await;

        for i in 0..5u8 {
            group.broadcast_raw(Frame { origin, bytes: Arc::new(vec![i]) });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(*rx.recv().await.unwrap().bytes, vec![3]);
    }
}
