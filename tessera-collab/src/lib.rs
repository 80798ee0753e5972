//! # tessera-collab: Relay, transport and persistence for Tessera
//!
//! Moves [`tessera_core`] updates between replicas and keeps them durable.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐    WebSocket      ┌─────────────┐
//! │ CollabSession │ ◄───────────────► │ SyncServer  │
//! │  Bridge +     │   Binary Proto    │ (relay)     │
//! │  SyncClient   │                   └──────┬──────┘
//! └───────────────┘                          │
//!                                 ┌──────────┴──────────┐
//!                                 ▼                     ▼
//!                          ┌─────────────┐     ┌─────────────────┐
//!                          │ RoomManager │     │ Persistence     │
//!                          │ (fan-out)   │     │ worker (FIFO)   │
//!                          └─────────────┘     └────────┬────────┘
//!                                                       ▼
//!                                              ┌─────────────────┐
//!                                              │ DocumentStore   │
//!                                              │ (RocksDB)       │
//!                                              └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket client with offline queue and reconnection
//! - [`session`]: Client session binding a bridge to the client
//! - [`presence`]: Cursors and selections, never persisted
//! - [`storage`]: Snapshot + update log stores
//! - [`persistence`]: FIFO worker in front of a store
//! - [`compaction`]: Periodic log folding

pub mod broadcast;
pub mod client;
pub mod compaction;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Departure, Frame, RoomManager};
pub use client::{ConnectionState, OfflineQueue, ReconnectPolicy, SyncClient, SyncEvent};
pub use compaction::{CompactionConfig, CompactionReport};
pub use persistence::{AppendReceipt, PersistenceHandle};
pub use presence::{AwarenessMessage, CursorColor, Point, PresenceRoom, RemotePeer};
pub use protocol::{AckPayload, JoinRequest, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer, SERVER_PEER_ID};
pub use session::{CollabSession, SessionConfig, SessionError, SessionEvent, SessionStatus};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, PersistedDocument, Persistence, StoreConfig,
    StoreError,
};
