//! RocksDB-backed persistent pod store.
//!
//! Column families:
//! - `pods` — Full pod records, bincode-encoded then LZ4 compressed
//! - `meta` — Per-pod record metadata (sizes, write count, timestamps)
//!
//! The store trails the in-memory table: records are written through after
//! each commit and read back only at startup, so writes dominate. Pods are
//! small enough that whole-record replacement beats any delta scheme.
//!
//! Performance targets:
//! - Open (1k pods): <50ms (bloom filters + block cache)
//! - Record write-through (100-item pod): <100μs
//! - Recovery scan (1k pods): <200ms
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use crate::model::Pod;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// Column family names.
const CF_PODS: &str = "pods";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_PODS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("podsync_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Record metadata stored alongside each pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodRecordMeta {
    pub pod_id: Uuid,
    /// Uncompressed record size in bytes
    pub record_size: u64,
    /// Compressed record size in bytes
    pub compressed_size: u64,
    /// Write-throughs applied to this record
    pub write_count: u64,
    /// First persisted (seconds since epoch)
    pub created_at: u64,
    /// Last persisted (seconds since epoch)
    pub updated_at: u64,
}

impl PodRecordMeta {
    fn new(pod_id: Uuid) -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            pod_id,
            record_size: 0,
            compressed_size: 0,
            write_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Aggregate store statistics, computed by scanning record metadata.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub pods: u64,
    pub record_bytes: u64,
    pub compressed_bytes: u64,
    pub total_writes: u64,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Pod record not found
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Pod record not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed pod store.
///
/// Durable write-through target for the in-memory table:
/// - LZ4-compressed full-record values
/// - Bloom filters for fast key lookup
/// - Atomic record + metadata batches
pub struct PodStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl PodStore {
    /// Open the pod store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(&config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Column family options: both families are small point-lookup tables.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    // ─── Records ──────────────────────────────────────────────────────

    /// Write a pod record through (LZ4 compressed), replacing any previous
    /// version. Record and metadata go in one atomic batch.
    pub fn put_pod(&self, pod: &Pod) -> Result<PodRecordMeta, StoreError> {
        let cf_pods = self.cf(CF_PODS)?;
        let cf_meta = self.cf(CF_META)?;

        let encoded = bincode::serde::encode_to_vec(pod, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_meta(pod.id)
            .unwrap_or_else(|_| PodRecordMeta::new(pod.id));
        meta.record_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.write_count += 1;
        meta.updated_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let key = pod.id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_pods, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load one pod record (LZ4 decompressed, bincode decoded).
    pub fn get_pod(&self, pod_id: Uuid) -> Result<Pod, StoreError> {
        let cf = self.cf(CF_PODS)?;
        let key = pod_id.as_bytes().to_vec();

        match self.db.get_cf(&cf, &key)? {
            Some(compressed) => Self::decode_record(&compressed),
            None => Err(StoreError::NotFound(pod_id)),
        }
    }

    /// Check if a pod record exists.
    pub fn pod_exists(&self, pod_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, pod_id.as_bytes())?.is_some())
    }

    /// Delete a pod record and its metadata atomically.
    pub fn delete_pod(&self, pod_id: Uuid) -> Result<(), StoreError> {
        let cf_pods = self.cf(CF_PODS)?;
        let cf_meta = self.cf(CF_META)?;

        let key = pod_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_pods, &key);
        batch.delete_cf(&cf_meta, &key);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load every pod record. Startup recovery path: the result seeds the
    /// in-memory table and rebuilds its indexes.
    pub fn list_pods(&self) -> Result<Vec<Pod>, StoreError> {
        let cf = self.cf(CF_PODS)?;
        let mut pods = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for entry in iter {
            let (_, value) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            pods.push(Self::decode_record(&value)?);
        }

        Ok(pods)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load one record's metadata.
    pub fn load_meta(&self, pod_id: Uuid) -> Result<PodRecordMeta, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, pod_id.as_bytes())? {
            Some(bytes) => PodRecordMeta::decode(&bytes),
            None => Err(StoreError::NotFound(pod_id)),
        }
    }

    /// Aggregate stats across all records (metadata scan).
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut stats = StoreStats::default();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for entry in iter {
            let (_, value) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let meta = PodRecordMeta::decode(&value)?;
            stats.pods += 1;
            stats.record_bytes += meta.record_size;
            stats.compressed_bytes += meta.compressed_size;
            stats.total_writes += meta.write_count;
        }

        Ok(stats)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn decode_record(compressed: &[u8]) -> Result<Pod, StoreError> {
        let encoded = lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (pod, _) = bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(pod)
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
