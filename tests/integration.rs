//! End-to-end tests of the public `Engine` surface.
//!
//! These exercise the full stack — WAL, memtables, SSTables, bloom
//! filters, compaction, recovery — through `basaltdb::{Engine,
//! EngineConfig}` only; no internal module is referenced.
//!
//! Each test gets its own `TempDir` store. Crashes are simulated by
//! closing an engine and corrupting or inspecting its files before
//! reopening — the WAL syncs on every append here (`SyncMode::Sync`),
//! so the durable state is exactly the acknowledged state.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use basaltdb::{Engine, EngineConfig, EngineError, SyncMode};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn sync_config() -> EngineConfig {
    EngineConfig {
        wal_sync_mode: SyncMode::Sync,
        ..EngineConfig::default()
    }
}

/// Small limits so a few hundred writes exercise every layer. Background
/// compaction is effectively disabled (very high trigger) so table counts
/// stay deterministic.
fn tiny_config() -> EngineConfig {
    EngineConfig {
        memtable_max_bytes: 1024,
        wal_sync_mode: SyncMode::Sync,
        wal_max_segment_bytes: 4 * 1024,
        sst_index_interval: 8,
        compaction_trigger_count: 100,
        ..EngineConfig::default()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
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

fn wait_for_flushes(engine: &Engine) {
    assert!(
        wait_until(Duration::from_secs(10), || {
            engine.stats().unwrap().pending_flushes == 0
        }),
        "flush queue did not drain"
    );
}

fn put_retrying(engine: &Engine, key: &[u8], value: &[u8]) {
    loop {
        match engine.put(key, value) {
            Ok(()) => return,
            Err(EngineError::Backpressure) => std::thread::sleep(Duration::from_millis(5)),
            Err(other) => panic!("put failed: {other}"),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Basic durability (scenario: put, put, delete, reopen)
// ------------------------------------------------------------------------------------------------

#[test]
fn acknowledged_mutations_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(dir.path(), sync_config()).unwrap();
    engine.put(b"k1", b"v1").unwrap();
    engine.put(b"k2", b"v2").unwrap();
    engine.delete(b"k1").unwrap();
    engine.close().unwrap();

    let engine = Engine::open(dir.path(), sync_config()).unwrap();
    assert_eq!(engine.get(b"k1").unwrap(), None);
    assert_eq!(engine.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    engine.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// WAL rotation across flushes (scenario: tiny limits, 200 records)
// ------------------------------------------------------------------------------------------------

#[test]
fn wal_rotates_and_old_segments_are_reclaimed() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), tiny_config()).unwrap();

    // ~50-byte records: enough volume to rotate both the memtable
    // (1 KiB) and the WAL segment (4 KiB) several times over. Segment
    // cleanup trails flushing, so track the high-water mark as we go.
    let mut max_segments = 0usize;
    for i in 0..200u32 {
        let key = format!("key-{i:05}");
        put_retrying(&engine, key.as_bytes(), &[b'd'; 38]);
        max_segments = max_segments.max(engine.stats().unwrap().wal_segments);
    }

    let stats = engine.stats().unwrap();
    assert!(
        stats.sstable_count + stats.pending_flushes >= 2,
        "expected at least two flushed or pending memtables"
    );
    assert!(
        max_segments >= 2,
        "expected WAL rotation, saw at most {max_segments} segment(s)"
    );

    // A final flush moves everything to SSTables; once the flush worker
    // catches up, only the active segment remains.
    engine.flush().unwrap();
    wait_for_flushes(&engine);
    assert!(
        wait_until(Duration::from_secs(5), || {
            engine.stats().unwrap().wal_segments == 1
        }),
        "fully-flushed WAL segments were not reclaimed"
    );

    for i in 0..200u32 {
        let key = format!("key-{i:05}");
        assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(vec![b'd'; 38]));
    }
    engine.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Bloom filter efficacy (scenario: 10k hits, 10k misses)
// ------------------------------------------------------------------------------------------------

#[test]
fn bloom_filters_keep_miss_lookups_off_disk() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), sync_config()).unwrap();

    for i in 0..10_000u32 {
        engine
            .put(format!("key{i:04}").as_bytes(), b"payload")
            .unwrap();
    }
    engine.flush().unwrap();
    wait_for_flushes(&engine);
    assert_eq!(engine.stats().unwrap().sstable_count, 1);

    let reads_before = engine.stats().unwrap().sst_data_reads;
    for i in 0..10_000u32 {
        assert_eq!(engine.get(format!("miss{i:04}").as_bytes()).unwrap(), None);
    }
    let miss_reads = engine.stats().unwrap().sst_data_reads - reads_before;

    // Target false-positive rate is 1%; 5% of 10k misses reaching the
    // data block means the filter is broken.
    assert!(
        miss_reads < 500,
        "{miss_reads} of 10000 misses reached the data block"
    );
    engine.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Recovery of unflushed writes (scenario: 500 keys, no flush)
// ------------------------------------------------------------------------------------------------

#[test]
fn unflushed_writes_recover_from_wal_alone() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(dir.path(), sync_config()).unwrap();
    for i in 0..500u32 {
        engine
            .put(format!("key{i:03}").as_bytes(), format!("val{i}").as_bytes())
            .unwrap();
    }
    // No flush: every record lives only in the WAL.
    assert_eq!(engine.stats().unwrap().sstable_count, 0);
    engine.close().unwrap();

    let engine = Engine::open(dir.path(), sync_config()).unwrap();
    assert_eq!(engine.stats().unwrap().sstable_count, 0);
    for i in 0..500u32 {
        assert_eq!(
            engine.get(format!("key{i:03}").as_bytes()).unwrap(),
            Some(format!("val{i}").into_bytes()),
            "key{i:03} lost"
        );
    }
    engine.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Compaction under overwrites and deletes (scenario: 1000 keys)
// ------------------------------------------------------------------------------------------------

#[test]
fn full_compaction_preserves_the_visible_state() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), sync_config()).unwrap();

    for i in 0..1000u32 {
        engine
            .put(format!("key_{i:04}").as_bytes(), format!("v_{i}").as_bytes())
            .unwrap();
    }
    engine.flush().unwrap();
    wait_for_flushes(&engine);

    for i in 0..1000u32 {
        let key = format!("key_{i:04}");
        if i % 2 == 1 {
            engine
                .put(key.as_bytes(), format!("v_{i}_new").as_bytes())
                .unwrap();
        } else {
            engine.delete(key.as_bytes()).unwrap();
        }
    }
    engine.flush().unwrap();
    wait_for_flushes(&engine);

    let before = engine.stats().unwrap().sstable_count;
    assert!(before >= 2);

    assert!(engine.compact().unwrap());
    let after = engine.stats().unwrap().sstable_count;
    assert!(after < before, "compaction went {before} -> {after}");

    let mut live = 0u32;
    for i in 0..1000u32 {
        let key = format!("key_{i:04}");
        match engine.get(key.as_bytes()).unwrap() {
            Some(value) => {
                assert_eq!(i % 2, 1, "{key} should have been deleted");
                assert_eq!(value, format!("v_{i}_new").into_bytes());
                live += 1;
            }
            None => assert_eq!(i % 2, 0, "{key} should be visible"),
        }
    }
    assert_eq!(live, 500);
    engine.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Corrupted WAL tail (scenario: flip the final 7 bytes)
// ------------------------------------------------------------------------------------------------

fn newest_wal_segment(root: &Path) -> std::path::PathBuf {
    let mut segments: Vec<_> = std::fs::read_dir(root.join("wal"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    segments.sort();
    segments.pop().expect("no WAL segment found")
}

#[test]
fn corrupted_wal_tail_rolls_back_to_the_last_good_record() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(dir.path(), sync_config()).unwrap();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    engine.put(b"c", b"3").unwrap();
    engine.close().unwrap();

    let segment = newest_wal_segment(dir.path());
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&segment)
        .unwrap();
    file.seek(SeekFrom::End(-7)).unwrap();
    file.write_all(&[0xA5; 7]).unwrap();
    file.sync_all().unwrap();

    // The engine must open, drop only the damaged tail record, and keep
    // everything before it.
    let engine = Engine::open(dir.path(), sync_config()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.get(b"c").unwrap(), None);
    engine.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Lifecycle and misc
// ------------------------------------------------------------------------------------------------

#[test]
fn open_close_reopen_empty_store() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.close().unwrap();
    engine.close().unwrap();

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    assert_eq!(engine.get(b"anything").unwrap(), None);
    engine.close().unwrap();
}

#[test]
fn reopen_is_identity_on_durable_state() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(dir.path(), tiny_config()).unwrap();
    for i in 0..100u32 {
        put_retrying(&engine, format!("k{i:03}").as_bytes(), format!("v{i}").as_bytes());
    }
    engine.delete(b"k050").unwrap();
    engine.close().unwrap();

    // Two reopen cycles with no writes in between must not change
    // anything.
    for _ in 0..2 {
        let engine = Engine::open(dir.path(), tiny_config()).unwrap();
        for i in 0..100u32 {
            let expected = if i == 50 {
                None
            } else {
                Some(format!("v{i}").into_bytes())
            };
            assert_eq!(engine.get(format!("k{i:03}").as_bytes()).unwrap(), expected);
        }
        engine.close().unwrap();
    }
}

#[test]
fn keys_differing_only_in_length_are_distinct() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), sync_config()).unwrap();

    engine.put(b"ab", b"short").unwrap();
    engine.put(b"abc", b"long").unwrap();
    engine.flush().unwrap();
    wait_for_flushes(&engine);

    assert_eq!(engine.get(b"ab").unwrap(), Some(b"short".to_vec()));
    assert_eq!(engine.get(b"abc").unwrap(), Some(b"long".to_vec()));
    assert_eq!(engine.get(b"a").unwrap(), None);
    engine.close().unwrap();
}

#[test]
fn empty_value_distinct_from_deleted_across_the_full_stack() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(dir.path(), sync_config()).unwrap();
    engine.put(b"empty", b"").unwrap();
    engine.put(b"gone", b"x").unwrap();
    engine.delete(b"gone").unwrap();
    engine.flush().unwrap();
    wait_for_flushes(&engine);
    engine.close().unwrap();

    let engine = Engine::open(dir.path(), sync_config()).unwrap();
    assert_eq!(engine.get(b"empty").unwrap(), Some(Vec::new()));
    assert_eq!(engine.get(b"gone").unwrap(), None);
    engine.close().unwrap();
}

#[test]
fn random_insertion_order_does_not_matter() {
    use rand::seq::SliceRandom;

    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), tiny_config()).unwrap();

    let mut keys: Vec<u32> = (0..300).collect();
    keys.shuffle(&mut rand::rng());

    for &i in &keys {
        put_retrying(
            &engine,
            format!("k{i:04}").as_bytes(),
            format!("v{i}").as_bytes(),
        );
    }
    engine.flush().unwrap();
    wait_for_flushes(&engine);

    // Every key resolves regardless of the order it arrived in — the
    // sorted tables and sparse indices are order-independent.
    for i in 0..300u32 {
        assert_eq!(
            engine.get(format!("k{i:04}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
    engine.close().unwrap();
}

#[test]
fn group_commit_mode_round_trips() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        wal_sync_mode: SyncMode::Group,
        wal_group_size: 10,
        wal_group_interval_ms: 50,
        ..EngineConfig::default()
    };

    let engine = Engine::open(dir.path(), config.clone()).unwrap();
    for i in 0..100u32 {
        engine
            .put(format!("g{i:03}").as_bytes(), b"grouped")
            .unwrap();
    }
    // close() syncs the tail group before the WAL handle drops.
    engine.close().unwrap();

    let engine = Engine::open(dir.path(), config).unwrap();
    for i in 0..100u32 {
        assert_eq!(
            engine.get(format!("g{i:03}").as_bytes()).unwrap(),
            Some(b"grouped".to_vec())
        );
    }
    engine.close().unwrap();
}
