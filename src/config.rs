//! Engine configuration.
//!
//! [`EngineConfig`] collects every tunable of the storage core: memtable
//! sizing, WAL sync policy and rotation, compaction strategy and its
//! thresholds, bloom filter target, and the sparse index interval.
//! Validation happens once, in [`Engine::open`](crate::engine::Engine::open),
//! before any file is touched.

use thiserror::Error;

/// A configuration field failed validation.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// How aggressively WAL appends are synced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every append. Durable on return, slowest.
    Sync,

    /// Never issue an explicit `fsync`; the OS page cache decides when
    /// data reaches disk. Acknowledged writes inside the final flush
    /// window may be lost on power failure.
    Async,

    /// Group commit: `fsync` once per group, when either the uncommitted
    /// record count reaches [`EngineConfig::wal_group_size`] or the time
    /// since the last sync exceeds [`EngineConfig::wal_group_interval_ms`].
    /// A call returning after a sync boundary is durable.
    Group,
}

/// Which compaction strategy the background compactor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyKind {
    /// Group SSTables of similar size (within a factor of two) and merge
    /// a group once it is large enough.
    SizeTiered,

    /// SSTables live in levels L0..Lk; an overflowing level merges into
    /// the next one.
    Leveled,

    /// Size-tiered grouping within L0, leveled from L1 downward.
    Hybrid,
}

/// Configuration for an [`Engine`](crate::engine::Engine) instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Active memtable size (bytes) that triggers rotation and flush.
    pub memtable_max_bytes: usize,

    /// Bound on the immutable-memtable flush queue. Writers that would
    /// rotate past this bound observe `Backpressure`.
    pub max_immutable_memtables: usize,

    /// WAL durability policy.
    pub wal_sync_mode: SyncMode,

    /// WAL segment size (bytes) that triggers rotation.
    pub wal_max_segment_bytes: u64,

    /// Records per group commit (only meaningful under [`SyncMode::Group`]).
    pub wal_group_size: usize,

    /// Time bound per group commit, in milliseconds.
    pub wal_group_interval_ms: u64,

    /// Compaction strategy family.
    pub compaction_strategy: CompactionStrategyKind,

    /// SSTable count (per group / at L0) that triggers compaction.
    pub compaction_trigger_count: usize,

    /// Upper bound on SSTables merged in one compaction pass.
    pub compaction_max_inputs: usize,

    /// Target bloom filter false-positive rate, in `(0, 1)`.
    pub bloom_target_fp: f64,

    /// Records between sparse-index entries in an SSTable.
    pub sst_index_interval: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memtable_max_bytes: 4 * 1024 * 1024,
            max_immutable_memtables: 2,
            wal_sync_mode: SyncMode::Group,
            wal_max_segment_bytes: 64 * 1024 * 1024,
            wal_group_size: 100,
            wal_group_interval_ms: 1000,
            compaction_strategy: CompactionStrategyKind::Hybrid,
            compaction_trigger_count: 4,
            compaction_max_inputs: 10,
            bloom_target_fp: 0.01,
            sst_index_interval: 128,
        }
    }
}

impl EngineConfig {
    /// Checks every field for plausibility. Called by `Engine::open`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memtable_max_bytes == 0 {
            return Err(ConfigError("memtable_max_bytes must be positive".into()));
        }
        if self.max_immutable_memtables == 0 {
            return Err(ConfigError(
                "max_immutable_memtables must be positive".into(),
            ));
        }
        if self.wal_max_segment_bytes == 0 {
            return Err(ConfigError("wal_max_segment_bytes must be positive".into()));
        }
        if self.wal_group_size == 0 {
            return Err(ConfigError("wal_group_size must be positive".into()));
        }
        if self.wal_group_interval_ms == 0 {
            return Err(ConfigError("wal_group_interval_ms must be positive".into()));
        }
        if self.compaction_trigger_count < 2 {
            return Err(ConfigError(
                "compaction_trigger_count must be at least 2".into(),
            ));
        }
        if self.compaction_max_inputs < 2 {
            return Err(ConfigError("compaction_max_inputs must be at least 2".into()));
        }
        if !(self.bloom_target_fp > 0.0 && self.bloom_target_fp < 1.0) {
            return Err(ConfigError("bloom_target_fp must be in (0, 1)".into()));
        }
        if self.sst_index_interval == 0 {
            return Err(ConfigError("sst_index_interval must be positive".into()));
        }
        Ok(())
    }
}
