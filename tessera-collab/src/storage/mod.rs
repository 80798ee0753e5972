//! Persistent storage for shared documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append / load   ┌───────────────────┐
//! │ SyncServer  │ ───────────────► │ PersistenceWorker │ (FIFO, own thread)
//! └─────────────┘                  └─────────┬─────────┘
//!                                            │ dyn Persistence
//!                              ┌─────────────┴─────────────┐
//!                              ▼                           ▼
//!                     ┌─────────────────┐         ┌─────────────────┐
//!                     │ DocumentStore   │         │ MemoryStore     │
//!                     │ (RocksDB)       │         │ (tests, --in-   │
//!                     │ documents       │         │  memory relay)  │
//!                     │ deltas          │         └─────────────────┘
//!                     │ metadata        │
//!                     └─────────────────┘
//! ```
//!
//! A persisted document is a compacted snapshot plus the ordered updates
//! appended since. Compaction folds the updates into the snapshot with the
//! update codec; observable state never changes.

pub mod memory;
pub mod rocks;

use tessera_core::codec::{self, DecodeError, Update};

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid document id: {0:?}")]
    InvalidDocumentId(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Stored update is corrupt: {0}")]
    Decode(#[from] DecodeError),

    #[error("Persistence worker has stopped")]
    WorkerStopped,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Everything stored for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDocument {
    pub doc_id: String,
    /// Result of the last compaction, if any.
    pub snapshot: Option<Vec<u8>>,
    /// Updates appended since the snapshot, in append order.
    pub updates: Vec<Vec<u8>>,
    /// Sequence number of the last append; 0 when nothing was ever written.
    pub last_seq: u64,
}

impl PersistedDocument {
    /// The record of a document nobody has written to yet.
    pub fn empty(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            snapshot: None,
            updates: Vec::new(),
            last_seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.updates.is_empty()
    }

    /// Snapshot and log merged into one full-state update.
    pub fn state(&self) -> Result<Update, DecodeError> {
        let parts: Vec<Update> = self
            .snapshot
            .iter()
            .chain(self.updates.iter())
            .map(|bytes| Update::from_bytes(bytes.clone()))
            .collect();
        codec::merge(&parts)
    }
}

/// A durable home for documents.
///
/// Implementations must make an append durable (to the configured sync
/// level) before returning its sequence number.
pub trait Persistence: Send + Sync {
    /// Snapshot plus log, or [`PersistedDocument::empty`] for unknown ids.
    fn load(&self, doc_id: &str) -> Result<PersistedDocument, StoreError>;

    /// Record one update; returns its sequence number.
    fn append(&self, doc_id: &str, update: &[u8]) -> Result<u64, StoreError>;

    /// Fold the log into the snapshot. Returns how many updates were folded.
    fn compact(&self, doc_id: &str) -> Result<u64, StoreError>;

    /// Number of updates appended since the last compaction.
    fn pending_updates(&self, doc_id: &str) -> Result<u64, StoreError>;

    /// Ids of stored documents starting with `prefix`, in key order.
    fn list_documents(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Administrative removal of a document and its log.
    fn delete_document(&self, doc_id: &str) -> Result<bool, StoreError>;

    /// Flush buffered writes to disk.
    fn flush(&self) -> Result<(), StoreError>;
}

/// Document ids are the key prefix of their log entries, so they must be
/// non-empty and free of the NUL separator. `/` is reserved by the relay's
/// URL routing.
pub fn validate_document_id(doc_id: &str) -> Result<(), StoreError> {
    if doc_id.is_empty() || doc_id.contains('\0') || doc_id.contains('/') {
        return Err(StoreError::InvalidDocumentId(doc_id.to_owned()));
    }
    Ok(())
}
