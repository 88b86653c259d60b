//! Storage engine — the public key-value surface over WAL, memtables,
//! SSTables, and compaction.
//!
//! # Write path
//!
//! A single writer lane (one mutex) covers the whole acknowledgement
//! sequence: backpressure check → WAL append (which assigns the sequence
//! number) → active-memtable insert → rotation if the table crossed its
//! threshold. A failed WAL append leaves the memtable untouched and the
//! error goes straight back to the caller — the engine never retries a
//! write.
//!
//! # Read path
//!
//! Readers never take the writer lane. They clone two `Arc`s under
//! short-lived locks — the active memtable and the readable set (immutable
//! memtables + SSTables) — then search newest-first: active → immutables →
//! tables ordered by their maximum sequence number. The first memtable hit
//! wins outright; across tables the highest-sequence result wins, and the
//! ordering lets the scan stop as soon as no remaining table can beat it.
//!
//! # Background work
//!
//! Three worker threads, all fed by crossbeam channels and all observing
//! shutdown at every blocking point:
//!
//! - the **flush worker** drains the immutable queue oldest-first, builds
//!   an SSTable per memtable, publishes it, releases the memtable's WAL
//!   checkpoint, and triggers WAL cleanup;
//! - the **compaction worker** wakes on a tick and after each flush,
//!   plans under the configured strategy, and merges;
//! - the **group-commit timer** (GROUP mode only) enforces the time bound
//!   on WAL syncs.
//!
//! A flush that fails twice in a row (one retry after backoff) puts the
//! engine in **degraded mode**: writes are refused until the process is
//! restarted, reads keep working, and `stats()` carries the error.

pub mod utils;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::compaction::{self, CompactionError, CompactionPlan, TableMeta};
use crate::config::{ConfigError, EngineConfig, SyncMode};
use crate::manifest::{Manifest, ManifestError};
use crate::memtable::{MemTable, MemTableGet};
use crate::sstable::{SsTable, SsTableError, SstGet, SstWriteOptions, SstWriter};
use crate::wal::{Wal, WalError, WalOptions};

/// WAL subdirectory under the data root.
pub const WAL_DIR: &str = "wal";
/// SSTable subdirectory under the data root.
pub const SST_DIR: &str = "sst";

/// Idle wake-up period for the compaction worker.
const COMPACTION_TICK: Duration = Duration::from_secs(5);
/// Pause before the single flush retry.
const FLUSH_RETRY_BACKOFF: Duration = Duration::from_millis(200);
/// Initial pause after a failed compaction pass; doubles up to the max.
const COMPACTION_BACKOFF_BASE: Duration = Duration::from_millis(500);
const COMPACTION_BACKOFF_MAX: Duration = Duration::from_secs(30);

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced at the engine boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Keys must be non-empty.
    #[error("invalid key: keys must be non-empty")]
    InvalidKey,

    /// A configuration value or call argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk state failed integrity validation.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// The engine is closed or closing.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// The flush queue is full; retry once a flush slot frees up.
    #[error("backpressure: flush queue is full")]
    Backpressure,

    /// Invariant violation (poisoned lock, impossible state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<WalError> for EngineError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(e) => EngineError::Io(e),
            WalError::Corrupt(reason) => EngineError::Corrupt(reason),
            WalError::InvalidArgument(reason) => EngineError::InvalidArgument(reason),
        }
    }
}

impl From<SsTableError> for EngineError {
    fn from(e: SsTableError) -> Self {
        match e {
            SsTableError::Io(e) => EngineError::Io(e),
            SsTableError::Corrupt(reason) => EngineError::Corrupt(reason),
        }
    }
}

impl From<ManifestError> for EngineError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Io(e) => EngineError::Io(e),
            ManifestError::Corrupt(reason) => EngineError::Corrupt(reason),
        }
    }
}

impl From<CompactionError> for EngineError {
    fn from(e: CompactionError) -> Self {
        match e {
            CompactionError::SsTable(e) => e.into(),
            CompactionError::Manifest(e) => e.into(),
            CompactionError::Io(e) => EngineError::Io(e),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::InvalidArgument(e.0)
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Point-in-time snapshot of engine state, as reported by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Live SSTable count per level.
    pub sstables_per_level: BTreeMap<u32, usize>,
    /// Total live SSTable count.
    pub sstable_count: usize,
    /// Sum of live SSTable file sizes in bytes.
    pub total_sst_bytes: u64,
    /// Immutable memtables awaiting flush.
    pub pending_flushes: usize,
    /// WAL segment files on disk (including the active one).
    pub wal_segments: usize,
    /// Data spans scanned by point lookups across live SSTables. Lookups
    /// the bloom filters rejected never touch a span, so this measures
    /// filter efficacy directly.
    pub sst_data_reads: u64,
    /// Highest sequence number assigned so far.
    pub highest_seq: u64,
    /// Whether the engine has entered degraded mode (writes refused).
    pub degraded: bool,
    /// Last terminal background-worker error, if any.
    pub worker_error: Option<String>,
}

// ------------------------------------------------------------------------------------------------
// Readable set
// ------------------------------------------------------------------------------------------------

/// An immutable memtable queued for flush, paired with the WAL checkpoint
/// that keeps its records replayable until the flush publishes.
#[derive(Clone)]
struct ImmutableMemtable {
    memtable: Arc<MemTable>,
    checkpoint: String,
}

/// One live SSTable plus the metadata the read path and planner need.
#[derive(Clone)]
struct TableEntry {
    table: Arc<SsTable>,
    level: u32,
    max_seq: u64,
}

/// Everything a reader may search besides the active memtable. Swapped
/// atomically as a whole (copy-on-write) — readers hold a consistent
/// snapshot for as long as they keep the `Arc`.
struct ReadableSet {
    /// Immutable memtables, newest first.
    immutables: Vec<ImmutableMemtable>,
    /// SSTables, ordered by `(max_seq, id)` descending.
    tables: Vec<TableEntry>,
}

impl ReadableSet {
    fn empty() -> Self {
        Self {
            immutables: Vec::new(),
            tables: Vec::new(),
        }
    }

    fn clone_contents(&self) -> Self {
        Self {
            immutables: self.immutables.clone(),
            tables: self.tables.clone(),
        }
    }

    fn sort_tables(&mut self) {
        self.tables
            .sort_by(|a, b| (b.max_seq, b.table.id).cmp(&(a.max_seq, a.table.id)));
    }
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

enum Signal {
    Wake,
    Shutdown,
}

struct EngineShared {
    config: EngineConfig,
    sst_dir: PathBuf,
    wal: Wal,
    checkpoints: Arc<CheckpointManager>,
    /// Writer lane: serializes WAL append, sequence assignment, memtable
    /// insert, and rotation.
    writer: Mutex<()>,
    /// The active memtable. Readers clone the `Arc` under a brief lock;
    /// only rotation (under the writer lane) replaces it.
    active: Mutex<Arc<MemTable>>,
    readable: Mutex<Arc<ReadableSet>>,
    manifest: Mutex<Manifest>,
    /// Serializes compaction passes (the background worker and explicit
    /// `compact()` calls).
    compaction: Mutex<()>,
    shutdown: AtomicBool,
    degraded: AtomicBool,
    worker_error: Mutex<Option<String>>,
    flush_tx: Sender<Signal>,
    compact_tx: Sender<Signal>,
    timer_tx: Sender<Signal>,
}

impl EngineShared {
    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active_snapshot(&self) -> Arc<MemTable> {
        Arc::clone(&self.lock(&self.active))
    }

    fn readable_snapshot(&self) -> Arc<ReadableSet> {
        Arc::clone(&self.lock(&self.readable))
    }

    /// Copy-on-write update of the readable set.
    fn update_readable(&self, mutate: impl FnOnce(&mut ReadableSet)) {
        let mut slot = self.lock(&self.readable);
        let mut next = slot.clone_contents();
        mutate(&mut next);
        *slot = Arc::new(next);
    }

    fn write_opts(&self) -> SstWriteOptions {
        SstWriteOptions {
            index_interval: self.config.sst_index_interval,
            bloom_target_fp: self.config.bloom_target_fp,
        }
    }

    /// Rotates `outgoing` (the current active memtable) into the immutable
    /// queue. Caller holds the writer lane and has verified queue capacity.
    fn rotate_active(&self, outgoing: &Arc<MemTable>) {
        let highest = outgoing.highest_seq();
        let checkpoint = format!("memtable-{highest:020}");
        self.checkpoints.register(&checkpoint, highest);

        let fresh = Arc::new(MemTable::new(self.config.memtable_max_bytes));
        *self.lock(&self.active) = fresh;

        self.update_readable(|set| {
            set.immutables.insert(
                0,
                ImmutableMemtable {
                    memtable: Arc::clone(outgoing),
                    checkpoint: checkpoint.clone(),
                },
            );
        });

        debug!(
            highest_seq = highest,
            pending = self.lock(&self.readable).immutables.len(),
            "memtable rotated"
        );
        let _ = self.flush_tx.send(Signal::Wake);
    }

    fn oldest_immutable(&self) -> Option<ImmutableMemtable> {
        self.readable_snapshot().immutables.last().cloned()
    }

    /// Flushes one immutable memtable to an SSTable and publishes it.
    fn flush_one(&self, imm: &ImmutableMemtable) -> Result<(), EngineError> {
        let flushed_seq = imm.memtable.highest_seq();
        let count = imm.memtable.len();

        let id = self.lock(&self.manifest).allocate_sst_id();
        let path = self.sst_dir.join(format!("{id}.sst"));
        SstWriter::new(&path, self.write_opts()).build(imm.memtable.iter_sorted(), count)?;

        let table = Arc::new(SsTable::open(&path, id)?);
        self.lock(&self.manifest).publish_flush(id, flushed_seq)?;

        self.update_readable(|set| {
            set.immutables
                .retain(|entry| !Arc::ptr_eq(&entry.memtable, &imm.memtable));
            set.tables.push(TableEntry {
                table: Arc::clone(&table),
                level: 0,
                max_seq: flushed_seq,
            });
            set.sort_tables();
        });

        // The flushed records are durable in an SSTable now; their WAL
        // range is no longer needed for recovery.
        self.wal.remove_checkpoint(&imm.checkpoint);
        self.wal.cleanup_up_to(flushed_seq)?;

        info!(sst_id = id, records = count, flushed_seq, "memtable flushed");
        let _ = self.compact_tx.send(Signal::Wake);
        Ok(())
    }

    fn flush_with_retry(&self, imm: &ImmutableMemtable) -> Result<(), EngineError> {
        match self.flush_one(imm) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "flush failed, retrying after backoff");
                std::thread::sleep(FLUSH_RETRY_BACKOFF);
                self.flush_one(imm)
            }
        }
    }

    fn enter_degraded(&self, reason: &EngineError) {
        error!(error = %reason, "flush failed twice, entering degraded mode");
        self.degraded.store(true, Ordering::SeqCst);
        *self.lock(&self.worker_error) = Some(format!("flush failed: {reason}"));
    }

    fn note_worker_error(&self, context: &str, reason: &EngineError) {
        *self.lock(&self.worker_error) = Some(format!("{context}: {reason}"));
    }

    fn table_metas(&self) -> Vec<TableMeta> {
        self.readable_snapshot()
            .tables
            .iter()
            .map(|entry| TableMeta {
                id: entry.table.id,
                level: entry.level,
                bytes: entry.table.file_size(),
            })
            .collect()
    }

    /// Runs one compaction described by `plan`: merge, manifest swap,
    /// readable-set swap, then input-file deletion.
    fn run_compaction(&self, plan: &CompactionPlan) -> Result<(), EngineError> {
        let tables: Vec<Arc<SsTable>> = self
            .readable_snapshot()
            .tables
            .iter()
            .map(|entry| Arc::clone(&entry.table))
            .collect();

        let outcome = {
            let mut manifest = self.lock(&self.manifest);
            compaction::execute(plan, &tables, &self.sst_dir, &mut manifest, self.write_opts())?
        };

        self.update_readable(|set| {
            set.tables
                .retain(|entry| !outcome.removed.contains(&entry.table.id));
            if let Some(added) = &outcome.added {
                set.tables.push(TableEntry {
                    table: Arc::clone(&added.table),
                    level: added.level,
                    max_seq: added.max_seq,
                });
            }
            set.sort_tables();
        });

        // In-flight readers hold `Arc<SsTable>` handles over an open mmap;
        // unlinking the paths is safe and space is reclaimed on last drop.
        for id in &outcome.removed {
            let path = self.sst_dir.join(format!("{id}.sst"));
            if let Err(e) = fs::remove_file(&path) {
                warn!(sst_id = id, error = %e, "failed to delete compacted input file");
            }
        }

        Ok(())
    }

    /// One strategy-driven compaction pass. Returns `true` when work was done.
    fn run_auto_compaction(&self) -> Result<bool, EngineError> {
        let _guard = self.lock(&self.compaction);
        let Some(plan) = compaction::plan(&self.table_metas(), &self.config) else {
            return Ok(false);
        };
        self.run_compaction(&plan)?;
        Ok(true)
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// The storage engine handle. Cheap to share via `&Engine`; all methods
/// take `&self`.
pub struct Engine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Engine {
    /// Opens (or creates) a store rooted at `root`.
    ///
    /// Recovery order: validate config → load manifest → delete orphan
    /// SSTable files → open live tables → replay WAL segments into a
    /// fresh active memtable → start background workers.
    pub fn open(root: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let root = root.as_ref();
        let wal_dir = root.join(WAL_DIR);
        let sst_dir = root.join(SST_DIR);
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&sst_dir)?;

        let manifest = Manifest::open(root)?;
        remove_orphan_tables(&sst_dir, &manifest)?;

        // A table the manifest vouches for must open; anything less is
        // real data loss and recovery cannot paper over it.
        let mut tables = Vec::with_capacity(manifest.tables().len());
        for entry in manifest.tables() {
            let path = sst_dir.join(format!("{}.sst", entry.id));
            let table = SsTable::open(&path, entry.id).map_err(|e| {
                EngineError::Corrupt(format!("manifest references unreadable SSTable {}: {e}", entry.id))
            })?;
            tables.push(TableEntry {
                table: Arc::new(table),
                level: entry.level,
                max_seq: entry.max_seq,
            });
        }

        let active = Arc::new(MemTable::new(config.memtable_max_bytes));
        let replayed_highest = Wal::replay_dir(&wal_dir, |record| {
            active.apply(record);
        })?;
        let next_seq = replayed_highest.max(manifest.last_seq()) + 1;

        let checkpoints = Arc::new(CheckpointManager::new());
        let wal = Wal::open(
            &wal_dir,
            next_seq,
            WalOptions {
                sync_mode: config.wal_sync_mode,
                max_segment_bytes: config.wal_max_segment_bytes,
                group_size: config.wal_group_size,
                group_interval: Duration::from_millis(config.wal_group_interval_ms),
            },
            Arc::clone(&checkpoints),
        )?;

        let mut readable = ReadableSet::empty();
        readable.tables = tables;
        readable.sort_tables();

        let (flush_tx, flush_rx) = unbounded();
        let (compact_tx, compact_rx) = unbounded();
        let (timer_tx, timer_rx) = unbounded();

        let shared = Arc::new(EngineShared {
            sst_dir,
            wal,
            checkpoints,
            writer: Mutex::new(()),
            active: Mutex::new(Arc::clone(&active)),
            readable: Mutex::new(Arc::new(readable)),
            manifest: Mutex::new(manifest),
            compaction: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            worker_error: Mutex::new(None),
            flush_tx,
            compact_tx,
            timer_tx,
            config,
        });

        let mut workers = Vec::new();
        {
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name("basalt-flush".into())
                    .spawn(move || flush_worker(&shared, &flush_rx))?,
            );
        }
        {
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name("basalt-compact".into())
                    .spawn(move || compaction_worker(&shared, &compact_rx))?,
            );
        }
        if shared.config.wal_sync_mode == SyncMode::Group {
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name("basalt-group-commit".into())
                    .spawn(move || group_commit_timer(&shared, &timer_rx))?,
            );
        }

        let engine = Self {
            shared,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        };

        // Replay may have rebuilt a memtable that is already past its
        // threshold; rotate it so the flush worker picks it up.
        if active.size_bytes() >= engine.shared.config.memtable_max_bytes {
            let _lane = engine.shared.lock(&engine.shared.writer);
            engine.shared.rotate_active(&active);
        }

        info!(
            root = %root.display(),
            next_seq,
            tables = engine.shared.readable_snapshot().tables.len(),
            replayed = replayed_highest,
            "engine opened"
        );
        Ok(engine)
    }

    /// Inserts or overwrites `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.write(key, Some(value))
    }

    /// Deletes `key`. Subsequent `get`s return `None` until a later put.
    pub fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), EngineError> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        if key.is_empty() {
            return Err(EngineError::InvalidKey);
        }
        if shared.degraded.load(Ordering::SeqCst) {
            let reason = shared
                .lock(&shared.worker_error)
                .clone()
                .unwrap_or_else(|| "degraded".into());
            return Err(EngineError::Io(io::Error::other(format!(
                "engine degraded: {reason}"
            ))));
        }

        let _lane = shared.lock(&shared.writer);
        let active = shared.active_snapshot();

        // Backpressure gate: refuse before the WAL sees the record, so a
        // rejected write leaves no trace anywhere.
        let will_rotate = active.would_exceed(key, value.map_or(0, <[u8]>::len));
        if will_rotate
            && shared.readable_snapshot().immutables.len() >= shared.config.max_immutable_memtables
        {
            return Err(EngineError::Backpressure);
        }

        let should_flush = match value {
            Some(value) => {
                let seq = shared.wal.log_put(key, value)?;
                active.put(key.to_vec(), value.to_vec(), seq)
            }
            None => {
                let seq = shared.wal.log_delete(key)?;
                active.delete(key.to_vec(), seq)
            }
        };

        if should_flush {
            shared.rotate_active(&active);
        }
        Ok(())
    }

    /// Point lookup. `Ok(None)` means "not found" (never written, or
    /// deleted); errors are real failures.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        if key.is_empty() {
            return Err(EngineError::InvalidKey);
        }

        match shared.active_snapshot().get(key) {
            MemTableGet::Present(value) => return Ok(Some(value)),
            MemTableGet::Tombstone => return Ok(None),
            MemTableGet::Absent => {}
        }

        let set = shared.readable_snapshot();
        for imm in &set.immutables {
            match imm.memtable.get(key) {
                MemTableGet::Present(value) => return Ok(Some(value)),
                MemTableGet::Tombstone => return Ok(None),
                MemTableGet::Absent => {}
            }
        }

        // Tables are ordered by max_seq descending. Track the best hit;
        // once no remaining table can hold a newer sequence, stop.
        let mut best: Option<(u64, Option<Vec<u8>>)> = None;
        for entry in &set.tables {
            if let Some((best_seq, _)) = &best
                && entry.max_seq <= *best_seq
            {
                break;
            }
            match entry.table.get(key)? {
                SstGet::Present { value, seq } => {
                    if best.as_ref().is_none_or(|(s, _)| seq > *s) {
                        best = Some((seq, Some(value)));
                    }
                }
                SstGet::Tombstone { seq } => {
                    if best.as_ref().is_none_or(|(s, _)| seq > *s) {
                        best = Some((seq, None));
                    }
                }
                SstGet::Absent => {}
            }
        }

        Ok(best.and_then(|(_, value)| value))
    }

    /// Rotates the active memtable (if non-empty) into the flush queue and
    /// returns once the flush is enqueued — not once it completes.
    pub fn flush(&self) -> Result<(), EngineError> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let _lane = shared.lock(&shared.writer);
        let active = shared.active_snapshot();
        if active.is_empty() {
            return Ok(());
        }
        if shared.readable_snapshot().immutables.len() >= shared.config.max_immutable_memtables {
            return Err(EngineError::Backpressure);
        }
        shared.rotate_active(&active);
        Ok(())
    }

    /// Merges **all** live SSTables into one, discarding shadowed versions
    /// and every tombstone. Runs synchronously; returns `true` when a
    /// merge actually happened (a store with fewer than two tables is a
    /// no-op).
    pub fn compact(&self) -> Result<bool, EngineError> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let _guard = shared.lock(&shared.compaction);
        let Some(plan) = compaction::plan_full(&shared.table_metas()) else {
            return Ok(false);
        };
        shared.run_compaction(&plan)?;
        Ok(true)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let shared = &self.shared;
        let set = shared.readable_snapshot();

        let mut sstables_per_level: BTreeMap<u32, usize> = BTreeMap::new();
        let mut total_sst_bytes = 0u64;
        let mut sst_data_reads = 0u64;
        for entry in &set.tables {
            *sstables_per_level.entry(entry.level).or_default() += 1;
            total_sst_bytes += entry.table.file_size();
            sst_data_reads += entry.table.data_reads();
        }

        Ok(EngineStats {
            sstables_per_level,
            sstable_count: set.tables.len(),
            total_sst_bytes,
            pending_flushes: set.immutables.len(),
            wal_segments: shared.wal.segment_count()?,
            sst_data_reads,
            highest_seq: shared.wal.last_seq(),
            degraded: shared.degraded.load(Ordering::SeqCst),
            worker_error: shared.lock(&shared.worker_error).clone(),
        })
    }

    /// Gracefully shuts down: refuses new operations, drains pending
    /// flushes, quiesces compaction, syncs and closes the WAL, joins the
    /// workers. Idempotent — the first error during drain is reported,
    /// but the shutdown always completes.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let shared = &self.shared;
        shared.shutdown.store(true, Ordering::SeqCst);

        let _ = shared.flush_tx.send(Signal::Shutdown);
        let _ = shared.compact_tx.send(Signal::Shutdown);
        let _ = shared.timer_tx.send(Signal::Shutdown);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in workers {
            if handle.join().is_err() {
                error!("background worker panicked during shutdown");
            }
        }

        let sync_result = shared.wal.sync();
        info!("engine closed");

        // A degraded engine could not drain its flush queue; that loss of
        // durability must reach the caller. Transient worker errors that
        // recovered on their own stay in stats() only.
        if shared.degraded.load(Ordering::SeqCst)
            && let Some(message) = shared.lock(&shared.worker_error).clone()
        {
            return Err(EngineError::Io(io::Error::other(message)));
        }
        sync_result.map_err(EngineError::from)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "close during drop reported an error");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background workers
// ------------------------------------------------------------------------------------------------

fn flush_worker(shared: &EngineShared, rx: &Receiver<Signal>) {
    loop {
        let draining = match rx.recv() {
            Ok(Signal::Wake) => false,
            Ok(Signal::Shutdown) | Err(_) => true,
        };

        while !shared.degraded.load(Ordering::SeqCst) {
            let Some(imm) = shared.oldest_immutable() else {
                break;
            };
            if let Err(e) = shared.flush_with_retry(&imm) {
                shared.enter_degraded(&e);
                break;
            }
        }

        if draining {
            break;
        }
    }
    debug!("flush worker exited");
}

fn compaction_worker(shared: &EngineShared, rx: &Receiver<Signal>) {
    let mut backoff = COMPACTION_BACKOFF_BASE;
    loop {
        match rx.recv_timeout(COMPACTION_TICK) {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        match shared.run_auto_compaction() {
            Ok(_) => backoff = COMPACTION_BACKOFF_BASE,
            Err(e) => {
                // Inputs are intact and any partial output is an orphan
                // that startup removes; retry after backoff. The backoff
                // wait still listens for shutdown.
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "compaction pass failed, rescheduling");
                shared.note_worker_error("compaction", &e);
                match rx.recv_timeout(backoff) {
                    Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
                }
                backoff = (backoff * 2).min(COMPACTION_BACKOFF_MAX);
            }
        }
    }
    debug!("compaction worker exited");
}

fn group_commit_timer(shared: &EngineShared, rx: &Receiver<Signal>) {
    let interval = Duration::from_millis(shared.config.wal_group_interval_ms);
    let poll = (interval / 4).max(Duration::from_millis(10));
    loop {
        match rx.recv_timeout(poll) {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
        if let Err(e) = shared.wal.maybe_group_sync() {
            warn!(error = %e, "group-commit sync failed");
        }
    }
    debug!("group-commit timer exited");
}

// ------------------------------------------------------------------------------------------------
// Startup helpers
// ------------------------------------------------------------------------------------------------

/// Deletes `.tmp` build leftovers and `.sst` files the manifest does not
/// vouch for — the debris of a flush or compaction that crashed before
/// publishing.
fn remove_orphan_tables(sst_dir: &Path, manifest: &Manifest) -> Result<(), EngineError> {
    for entry in fs::read_dir(sst_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let orphan = if name.ends_with(".tmp") {
            true
        } else if let Some(stem) = name.strip_suffix(".sst") {
            !stem.parse::<u64>().is_ok_and(|id| manifest.contains(id))
        } else {
            false
        };

        if orphan {
            warn!(path = %path.display(), "removing orphan SSTable file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
