//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — Full board states (LZ4 compressed, keyed by board_id:timestamp)
//! - `metadata`  — Per-board bookkeeping (bincode: counts, sizes, latest timestamp)
//!
//! Snapshots are the only durable record of a board. There is no delta log:
//! a crash between snapshots loses at most one snapshot interval of edits,
//! which the update-count and elapsed-time triggers in the room layer keep
//! small. Keys order snapshots chronologically per board, so "latest" is a
//! single reverse seek and retention is a prefix scan.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write (default: true — snapshots are rare and
    /// are the only durable record)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("boardsync_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory, no fsync).
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

/// Per-board bookkeeping stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardRecord {
    /// Board UUID
    pub board_id: Uuid,
    /// Snapshots currently stored for this board
    pub snapshot_count: u64,
    /// Timestamp key of the newest snapshot (ms since epoch)
    pub latest_ms: u64,
    /// Uncompressed size of the newest snapshot in bytes
    pub snapshot_size: u64,
    /// Compressed size of the newest snapshot in bytes
    pub compressed_size: u64,
    /// First time this board was persisted (ms since epoch)
    pub created_ms: u64,
}

impl BoardRecord {
    fn new(board_id: Uuid) -> Self {
        Self {
            board_id,
            snapshot_count: 0,
            latest_ms: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_ms: wall_clock_ms(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// A snapshot loaded back out of the store.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub board_id: Uuid,
    /// Timestamp key the snapshot was stored under (ms since epoch)
    pub taken_ms: u64,
    /// Full board state, ready for `BoardDocument::from_full_state`
    pub state: Vec<u8>,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Board has no record in the store
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
            StoreError::NotFound(id) => write!(f, "Board not found: {id}"),
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

/// RocksDB-backed snapshot store.
///
/// Durable storage for board states with:
/// - LZ4-compressed snapshots
/// - Chronological snapshot keys per board
/// - Bloom filters for fast key lookup
/// - Atomic write batches for snapshot + bookkeeping consistency
pub struct SnapshotStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
}

impl SnapshotStore {
    /// Open the snapshot store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        // Build column family descriptors with per-CF options
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
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

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        // Block-based table with bloom filter and cache
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Values arrive LZ4-compressed already; recompressing them
                // in the table files buys nothing
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                // Prefix-scanned by board_id for latest/retention lookups
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                // Small values, frequent reads
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full board snapshot (LZ4 compressed).
    ///
    /// The snapshot is the complete board state from
    /// `BoardDocument::encode_full_state`. Timestamp keys are bumped past
    /// the previous snapshot when the wall clock has not advanced, so two
    /// saves in the same millisecond never collide and "latest" stays
    /// unambiguous.
    pub fn save_snapshot(&self, board_id: Uuid, state: &[u8]) -> Result<BoardRecord, StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);

        let mut record = self
            .board_record(board_id)
            .unwrap_or_else(|_| BoardRecord::new(board_id));
        let taken_ms = wall_clock_ms().max(record.latest_ms + 1);
        record.latest_ms = taken_ms;
        record.snapshot_count += 1;
        record.snapshot_size = state.len() as u64;
        record.compressed_size = compressed.len() as u64;

        // Atomic batch write: snapshot + bookkeeping
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snaps, snapshot_key(board_id, taken_ms), &compressed);
        batch.put_cf(&cf_meta, board_id.as_bytes(), &record.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(record)
    }

    /// Load the most recent snapshot for a board.
    ///
    /// `Ok(None)` means the board has never been persisted — a fresh board,
    /// not a failure.
    pub fn get_latest_snapshot(&self, board_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;

        // Reverse seek from the highest possible key for this board; the
        // first hit inside the prefix is the newest snapshot
        let seek = snapshot_key(board_id, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
                if key.len() < 24 || &key[..16] != board_id.as_bytes() {
                    return Ok(None);
                }
                let mut ts_buf = [0u8; 8];
                ts_buf.copy_from_slice(&key[16..24]);
                let state = lz4_flex::decompress_size_prepended(&value)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                Ok(Some(Snapshot {
                    board_id,
                    taken_ms: u64::from_be_bytes(ts_buf),
                    state,
                }))
            }
            None => Ok(None),
        }
    }

    /// List snapshot timestamps for a board, oldest first.
    pub fn list_snapshots(&self, board_id: Uuid) -> Result<Vec<u64>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let start_key = snapshot_key(board_id, 0);

        let mut timestamps = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != board_id.as_bytes() {
                break;
            }
            let mut ts_buf = [0u8; 8];
            ts_buf.copy_from_slice(&key[16..24]);
            timestamps.push(u64::from_be_bytes(ts_buf));
        }

        Ok(timestamps)
    }

    /// Number of snapshots currently stored for a board.
    pub fn snapshot_count(&self, board_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.list_snapshots(board_id)?.len() as u64)
    }

    /// Delete oldest snapshots beyond `retain`. Returns how many were
    /// removed. The newest snapshot is never touched.
    pub fn cleanup_old_snapshots(&self, board_id: Uuid, retain: usize) -> Result<u64, StoreError> {
        let timestamps = self.list_snapshots(board_id)?;
        // Never drop the only durable record, whatever retain says
        let retain = retain.max(1);
        if timestamps.len() <= retain {
            return Ok(0);
        }

        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let excess = &timestamps[..timestamps.len() - retain];

        let mut batch = WriteBatch::default();
        for ts in excess {
            batch.delete_cf(&cf_snaps, snapshot_key(board_id, *ts));
        }
        if let Ok(mut record) = self.board_record(board_id) {
            record.snapshot_count = record.snapshot_count.saturating_sub(excess.len() as u64);
            batch.put_cf(&cf_meta, board_id.as_bytes(), &record.encode()?);
        }
        self.db.write(batch)?;

        Ok(excess.len() as u64)
    }

    // ─── Bookkeeping ──────────────────────────────────────────────────

    /// Load the bookkeeping record for a board.
    pub fn board_record(&self, board_id: Uuid) -> Result<BoardRecord, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, board_id.as_bytes())? {
            Some(bytes) => BoardRecord::decode(&bytes),
            None => Err(StoreError::NotFound(board_id)),
        }
    }

    /// Check if a board has ever been persisted.
    pub fn board_exists(&self, board_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, board_id.as_bytes())?.is_some())
    }

    /// List all board IDs in the store.
    pub fn list_boards(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut board_ids = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?,
                );
                board_ids.push(id);
            }
        }

        Ok(board_ids)
    }

    /// Delete a board: every snapshot plus its bookkeeping record.
    pub fn delete_board(&self, board_id: Uuid) -> Result<(), StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_meta, board_id.as_bytes());
        for ts in self.list_snapshots(board_id)? {
            batch.delete_cf(&cf_snaps, snapshot_key(board_id, ts));
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Force a flush to disk (called on shutdown).
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// Build a snapshot key: board_id (16 bytes) + timestamp ms (8 bytes big-endian).
fn snapshot_key(board_id: Uuid, timestamp_ms: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(board_id.as_bytes());
    key.extend_from_slice(&timestamp_ms.to_be_bytes());
    key
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
