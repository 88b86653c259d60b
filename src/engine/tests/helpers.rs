use std::path::Path;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::config::{EngineConfig, SyncMode};
use crate::engine::Engine;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Small thresholds so a handful of writes exercises rotation, flushing,
/// and compaction. Per-append fsync keeps durability deterministic.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        memtable_max_bytes: 512,
        max_immutable_memtables: 2,
        wal_sync_mode: SyncMode::Sync,
        wal_max_segment_bytes: 8 * 1024,
        compaction_trigger_count: 4,
        sst_index_interval: 4,
        ..EngineConfig::default()
    }
}

pub fn open(path: &Path, config: EngineConfig) -> Engine {
    init_tracing();
    Engine::open(path, config).expect("engine open")
}

/// Polls `cond` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Writes with the documented backpressure contract: retry until a flush
/// slot frees up.
pub fn put_retrying(engine: &Engine, key: &[u8], value: &[u8]) {
    loop {
        match engine.put(key, value) {
            Ok(()) => return,
            Err(crate::engine::EngineError::Backpressure) => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(other) => panic!("put failed: {other}"),
        }
    }
}

/// Blocks until the flush queue is empty.
pub fn wait_for_flushes(engine: &Engine) {
    assert!(
        wait_until(Duration::from_secs(10), || {
            engine.stats().unwrap().pending_flushes == 0
        }),
        "flush queue did not drain"
    );
}
