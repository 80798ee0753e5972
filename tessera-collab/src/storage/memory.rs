//! In-process document store.
//!
//! Same contract as the RocksDB store without the disk: every document is a
//! compressed snapshot plus a list of compressed deltas. Used by tests and
//! by relays started with `--in-memory`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tessera_core::codec::Update;

use super::{validate_document_id, PersistedDocument, Persistence, StoreError};

/// One LZ4-compressed update.
#[derive(Debug, Clone)]
struct CompressedDelta {
    seq: u64,
    compressed: Vec<u8>,
}

impl CompressedDelta {
    fn compress(seq: u64, data: &[u8]) -> Self {
        Self {
            seq,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    fn decompress(&self) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct DeltaLog {
    snapshot: Option<Vec<u8>>,
    deltas: Vec<CompressedDelta>,
    last_seq: u64,
}

impl DeltaLog {
    fn decompressed(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        self.deltas.iter().map(CompressedDelta::decompress).collect()
    }
}

/// Map-backed [`Persistence`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<BTreeMap<String, DeltaLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DeltaLog>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Persistence for MemoryStore {
    fn load(&self, doc_id: &str) -> Result<PersistedDocument, StoreError> {
        validate_document_id(doc_id)?;
        let documents = self.lock();
        let Some(log) = documents.get(doc_id) else {
            return Ok(PersistedDocument::empty(doc_id));
        };

        let snapshot = match &log.snapshot {
            Some(compressed) => Some(
                lz4_flex::decompress_size_prepended(compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?,
            ),
            None => None,
        };
        Ok(PersistedDocument {
            doc_id: doc_id.to_owned(),
            snapshot,
            updates: log.decompressed()?,
            last_seq: log.last_seq,
        })
    }

    fn append(&self, doc_id: &str, update: &[u8]) -> Result<u64, StoreError> {
        validate_document_id(doc_id)?;
        Update::from_bytes(update.to_vec()).validate()?;

        let mut documents = self.lock();
        let log = documents.entry(doc_id.to_owned()).or_default();
        log.last_seq += 1;
        log.deltas.push(CompressedDelta::compress(log.last_seq, update));
        Ok(log.last_seq)
    }

    fn compact(&self, doc_id: &str) -> Result<u64, StoreError> {
        validate_document_id(doc_id)?;
        let record = self.load(doc_id)?;
        if record.updates.is_empty() {
            return Ok(0);
        }
        let merged = record.state()?;

        let mut documents = self.lock();
        let Some(log) = documents.get_mut(doc_id) else {
            return Ok(0);
        };
        // Appends that raced the merge stay in the log.
        let folded_through = record.last_seq;
        let before = log.deltas.len();
        log.deltas.retain(|d| d.seq > folded_through);
        log.snapshot = Some(lz4_flex::compress_prepend_size(merged.as_bytes()));
        Ok((before - log.deltas.len()) as u64)
    }

    fn pending_updates(&self, doc_id: &str) -> Result<u64, StoreError> {
        Ok(self.lock().get(doc_id).map_or(0, |log| log.deltas.len() as u64))
    }

    fn list_documents(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete_document(&self, doc_id: &str) -> Result<bool, StoreError> {
        validate_document_id(doc_id)?;
        Ok(self.lock().remove(doc_id).is_some())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{DiagramDoc, Geometry, Node, Operation};

    fn put(doc: &mut DiagramDoc, id: &str) -> Vec<u8> {
        doc.apply_local_operation(Operation::PutNode(Node::with_id(id, "box", Geometry::default())))
            .unwrap()
            .into_bytes()
    }

    #[test]
    fn test_append_and_load() {
        let store = MemoryStore::new();
        let mut doc = DiagramDoc::new();
        assert_eq!(store.append("d1", &put(&mut doc, "n1")).unwrap(), 1);
        assert_eq!(store.append("d1", &put(&mut doc, "n2")).unwrap(), 2);

        let record = store.load("d1").unwrap();
        assert_eq!(record.updates.len(), 2);
        assert_eq!(record.last_seq, 2);
        assert!(store.load("other").unwrap().is_empty());
    }

    #[test]
    fn test_compact_folds_log() {
        let store = MemoryStore::new();
        let mut doc = DiagramDoc::new();
        for id in ["n1", "n2", "n3"] {
            store.append("d1", &put(&mut doc, id)).unwrap();
        }

        assert_eq!(store.compact("d1").unwrap(), 3);
        assert_eq!(store.pending_updates("d1").unwrap(), 0);
        assert_eq!(store.compact("d1").unwrap(), 0);

        let mut replica = DiagramDoc::new();
        replica
            .apply_remote_update(&store.load("d1").unwrap().state().unwrap())
            .unwrap();
        assert_eq!(replica.snapshot(), doc.snapshot());
    }

    #[test]
    fn test_rejects_garbage() {
        let store = MemoryStore::new();
        assert!(matches!(store.append("d1", &[0xFF; 4]), Err(StoreError::Decode(_))));
        assert!(matches!(store.append("", &[0, 0]), Err(StoreError::InvalidDocumentId(_))));
        assert_eq!(store.document_count(), 0);
    }

    #[test]
    fn test_list_and_delete() {
        let store = MemoryStore::new();
        let mut doc = DiagramDoc::new();
        store.append("team-a", &put(&mut doc, "n1")).unwrap();
        store.append("team-b", &put(&mut doc, "n2")).unwrap();
        store.append("solo", &put(&mut doc, "n3")).unwrap();

        assert_eq!(store.list_documents("team-").unwrap(), vec!["team-a", "team-b"]);
        assert!(store.delete_document("solo").unwrap());
        assert!(!store.delete_document("solo").unwrap());
        assert_eq!(store.list_documents("").unwrap().len(), 2);
    }
}
