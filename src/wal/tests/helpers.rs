use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::checkpoint::CheckpointManager;
use crate::config::SyncMode;
use crate::engine::utils::Record;
use crate::wal::{Wal, WalError, WalOptions};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Options with per-append fsync and an effectively unlimited segment.
pub fn sync_opts() -> WalOptions {
    WalOptions {
        sync_mode: SyncMode::Sync,
        max_segment_bytes: u64::MAX,
        group_size: 100,
        group_interval: Duration::from_secs(1),
    }
}

/// Opens a WAL at `dir` starting from sequence 1 with a fresh
/// checkpoint manager.
pub fn open_wal(dir: &Path, opts: WalOptions) -> (Wal, Arc<CheckpointManager>) {
    let checkpoints = Arc::new(CheckpointManager::new());
    let wal = Wal::open(dir, 1, opts, Arc::clone(&checkpoints)).unwrap();
    (wal, checkpoints)
}

/// Replays `dir` and collects every record.
pub fn replay_all(dir: &Path) -> Result<Vec<Record>, WalError> {
    let mut records = Vec::new();
    Wal::replay_dir(dir, |r| records.push(r))?;
    Ok(records)
}
