//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` - compacted snapshot per document (LZ4 compressed)
//! - `deltas`    - updates appended since the snapshot (LZ4 compressed)
//! - `metadata`  - per-document bookkeeping (bincode)
//!
//! Delta keys are `<doc_id bytes><0x00><seq: u64 big-endian>`, so one
//! document's log is a contiguous, ordered key range.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use tessera_core::codec::{self, Update};

use super::{validate_document_id, PersistedDocument, Persistence, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write before acknowledging it (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Sequence number of the last append.
    pub last_seq: u64,
    /// Updates appended since the last compaction.
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    pub compactions: u64,
    /// Seconds since the epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str) -> Self {
        let now = now_secs();
        Self {
            doc_id: doc_id.to_owned(),
            last_seq: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            compactions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Document store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 frames.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Many small appends, range-scanned per document.
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Appends ──────────────────────────────────────────────────────

    /// Durably append one update. Returns its sequence number.
    pub fn append_update(&self, doc_id: &str, update: &[u8]) -> Result<u64, StoreError> {
        validate_document_id(doc_id)?;
        Update::from_bytes(update.to_vec()).validate()?;

        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.last_seq += 1;
        meta.delta_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf_deltas,
            Self::delta_key(doc_id, meta.last_seq),
            lz4_flex::compress_prepend_size(update),
        );
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::trace!("Appended update {} ({} bytes) to {doc_id}", meta.last_seq, update.len());
        Ok(meta.last_seq)
    }

    // ─── Loads ────────────────────────────────────────────────────────

    /// Snapshot plus log, or the empty record for an unknown id.
    pub fn load_document(&self, doc_id: &str) -> Result<PersistedDocument, StoreError> {
        validate_document_id(doc_id)?;
        let Some(meta) = self.load_metadata(doc_id)? else {
            return Ok(PersistedDocument::empty(doc_id));
        };

        let snapshot = match self.db.get_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes())? {
            Some(compressed) => Some(decompress(&compressed)?),
            None => None,
        };
        let updates = self
            .scan_deltas(doc_id)?
            .into_iter()
            .map(|(_, value)| decompress(&value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PersistedDocument {
            doc_id: doc_id.to_owned(),
            snapshot,
            updates,
            last_seq: meta.last_seq,
        })
    }

    pub fn load_metadata(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        match self.db.get_cf(self.cf(CF_METADATA)?, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stored document ids starting with `prefix`, in key order.
    pub fn list_documents(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }

        Ok(ids)
    }

    // ─── Compaction ───────────────────────────────────────────────────

    /// Merge snapshot and log into a new snapshot in one atomic batch.
    pub fn compact_document(&self, doc_id: &str) -> Result<u64, StoreError> {
        validate_document_id(doc_id)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut meta) = self.load_metadata(doc_id)? else {
            return Ok(0);
        };
        let deltas = self.scan_deltas(doc_id)?;
        if deltas.is_empty() {
            return Ok(0);
        }

        let mut parts = Vec::with_capacity(deltas.len() + 1);
        if let Some(compressed) = self.db.get_cf(cf_docs, doc_id.as_bytes())? {
            parts.push(Update::from_bytes(decompress(&compressed)?));
        }
        for (_, value) in &deltas {
            parts.push(Update::from_bytes(decompress(value)?));
        }
        let merged = codec::merge(&parts)?;
        let compressed = lz4_flex::compress_prepend_size(merged.as_bytes());

        let folded = deltas.len() as u64;
        meta.delta_count = 0;
        meta.snapshot_size = merged.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.compactions += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc_id.as_bytes(), compressed);
        for (key, _) in &deltas {
            batch.delete_cf(cf_deltas, key);
        }
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Compacted {folded} updates of {doc_id} into a {} byte snapshot",
            meta.snapshot_size
        );
        Ok(folded)
    }

    // ─── Administration ───────────────────────────────────────────────

    /// Remove a document, its snapshot and its log.
    pub fn delete_document(&self, doc_id: &str) -> Result<bool, StoreError> {
        validate_document_id(doc_id)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.load_metadata(doc_id)?.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, doc_id.as_bytes());
        batch.delete_cf(cf_meta, doc_id.as_bytes());
        for (key, _) in self.scan_deltas(doc_id)? {
            batch.delete_cf(cf_deltas, key);
        }
        self.db.write_opt(batch, &self.write_options())?;

        log::info!("Deleted document {doc_id}");
        Ok(true)
    }

    /// Flush memtables of every column family to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    /// Flush and release the database.
    pub fn close(self) -> Result<(), StoreError> {
        self.flush()
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn delta_prefix(doc_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(doc_id.len() + 1);
        prefix.extend_from_slice(doc_id.as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn delta_key(doc_id: &str, seq: u64) -> Vec<u8> {
        let mut key = Self::delta_prefix(doc_id);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Raw (key, compressed value) pairs of one document's log, in order.
    fn scan_deltas(&self, doc_id: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = Self::delta_prefix(doc_id);
        let mut deltas = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            deltas.push((key.to_vec(), value.to_vec()));
        }

        Ok(deltas)
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("Flush on close failed for {}: {e}", self.config.path.display());
        }
    }
}

impl Persistence for DocumentStore {
    fn load(&self, doc_id: &str) -> Result<PersistedDocument, StoreError> {
        self.load_document(doc_id)
    }

    fn append(&self, doc_id: &str, update: &[u8]) -> Result<u64, StoreError> {
        self.append_update(doc_id, update)
    }

    fn compact(&self, doc_id: &str) -> Result<u64, StoreError> {
        self.compact_document(doc_id)
    }

    fn pending_updates(&self, doc_id: &str) -> Result<u64, StoreError> {
        Ok(self.load_metadata(doc_id)?.map_or(0, |m| m.delta_count))
    }

    fn list_documents(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        DocumentStore::list_documents(self, prefix)
    }

    fn delete_document(&self, doc_id: &str) -> Result<bool, StoreError> {
        DocumentStore::delete_document(self, doc_id)
    }

    fn flush(&self) -> Result<(), StoreError> {
        DocumentStore::flush(self)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
