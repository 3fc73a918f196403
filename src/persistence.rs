//! Durable storage for opaque document-state snapshots.
//!
//! The service only ever asks two things of a store: load the latest snapshot
//! bytes for a document id (or nothing, for a new document), and overwrite
//! them. [`MemoryStateStore`] backs tests and ephemeral deployments;
//! [`RocksStateStore`] is the durable implementation.
//!
//! Column families:
//! - `states`   — LZ4-compressed snapshot, keyed by document id
//! - `metadata` — bincode record (sizes, updated_at), same key

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable load/save of opaque snapshot bytes by document id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest persisted snapshot, or `None` for a never-saved document.
    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the persisted snapshot.
    async fn save_state(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store with operation counters, for tests and ephemeral setups.
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, Vec<u8>>>,
    loads: AtomicU64,
    saves: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self { states: Mutex::new(HashMap::new()), loads: AtomicU64::new(0), saves: AtomicU64::new(0) }
    }

    /// Number of `load_state` calls served.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of `save_state` calls served.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let states = self
            .states
            .lock()
            .map_err(|_| StoreError::Database("state map unavailable".to_string()))?;
        Ok(states.get(document_id).cloned())
    }

    async fn save_state(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        let mut states = self
            .states
            .lock()
            .map_err(|_| StoreError::Database("state map unavailable".to_string()))?;
        states.insert(document_id.to_string(), state.to_vec());
        Ok(())
    }
}

const CF_STATES: &str = "states";
const CF_METADATA: &str = "metadata";
const COLUMN_FAMILIES: &[&str] = &[CF_STATES, CF_METADATA];

/// RocksDB store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: i32,
    /// fsync on every write (off by default; RocksDB batches fsync)
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("labnote_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches and a caller-supplied temp directory, for tests.
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

/// Snapshot bookkeeping stored alongside the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateMetadata {
    document_id: String,
    state_size: u64,
    compressed_size: u64,
    updated_at: u64,
}

impl StateMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// RocksDB-backed snapshot store.
pub struct RocksStateStore {
    /// Single-threaded mode — concurrency is handled above, in tokio
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStateStore {
    /// Open (creating if missing) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed before they reach RocksDB
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family: {name}")))
    }

    fn save_sync(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError> {
        let cf_states = self.cf(CF_STATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);
        let meta = StateMetadata {
            document_id: document_id.to_string(),
            state_size: state.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        // Snapshot and metadata land atomically
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_states, document_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, document_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn load_sync(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_STATES)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for RocksStateStore {
    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.load_sync(document_id)
    }

    async fn save_state(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError> {
        self.save_sync(document_id, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryStateStore::new();
        store.save_state("doc-1", &[1, 2, 3]).await.unwrap();
        assert_eq!(store.load_state("doc-1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_missing_is_none() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load_state("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rocks_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStateStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        let state: Vec<u8> = (0..255).collect();
        store.save_state("doc-1", &state).await.unwrap();
        assert_eq!(store.load_state("doc-1").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_rocks_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStateStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert_eq!(store.load_state("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rocks_overwrite_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStateStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        store.save_state("doc-1", b"first").await.unwrap();
        store.save_state("doc-1", b"second").await.unwrap();
        assert_eq!(store.load_state("doc-1").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_rocks_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let store = RocksStateStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_state("doc-1", b"durable").await.unwrap();
        }

        let store = RocksStateStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_state("doc-1").await.unwrap(), Some(b"durable".to_vec()));
    }
}
