//! Micro-benchmarks for the core engine operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- put       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use basaltdb::{Engine, EngineConfig, SyncMode};
use tempfile::TempDir;

/// Default value payload (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// A roomy memtable keeps everything in memory — measures the pure
/// write path (WAL append + memtable insert) without flush noise.
fn open_memtable_only(dir: &std::path::Path, sync_mode: SyncMode) -> Engine {
    Engine::open(
        dir,
        EngineConfig {
            memtable_max_bytes: 256 * 1024 * 1024,
            wal_sync_mode: sync_mode,
            ..EngineConfig::default()
        },
    )
    .expect("open")
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Bytes(VALUE_128B.len() as u64));

    for (label, mode) in [("async", SyncMode::Async), ("group", SyncMode::Group)] {
        group.bench_function(BenchmarkId::new("128B", label), |b| {
            let dir = TempDir::new().unwrap();
            let engine = open_memtable_only(dir.path(), mode);
            let mut i = 0u64;
            b.iter(|| {
                engine.put(&make_key(i), black_box(VALUE_128B)).unwrap();
                i += 1;
            });
            engine.close().unwrap();
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    // Memtable-resident reads.
    group.bench_function("memtable_hit", |b| {
        let dir = TempDir::new().unwrap();
        let engine = open_memtable_only(dir.path(), SyncMode::Async);
        for i in 0..10_000 {
            engine.put(&make_key(i), VALUE_128B).unwrap();
        }
        let mut i = 0u64;
        b.iter(|| {
            let key = make_key(i % 10_000);
            black_box(engine.get(&key).unwrap());
            i += 1;
        });
        engine.close().unwrap();
    });

    // SSTable-resident reads, hits and bloom-filtered misses.
    for (label, key_of) in [
        ("sstable_hit", (|i: u64| make_key(i % 10_000)) as fn(u64) -> Vec<u8>),
        ("sstable_miss", |i: u64| format!("absent-{i:012}").into_bytes()),
    ] {
        group.bench_function(label, |b| {
            let dir = TempDir::new().unwrap();
            let engine = open_memtable_only(dir.path(), SyncMode::Async);
            for i in 0..10_000 {
                engine.put(&make_key(i), VALUE_128B).unwrap();
            }
            engine.flush().unwrap();
            while engine.stats().unwrap().pending_flushes > 0 {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }

            let mut i = 0u64;
            b.iter(|| {
                black_box(engine.get(&key_of(i)).unwrap());
                i += 1;
            });
            engine.close().unwrap();
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
