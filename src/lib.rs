//! # BasaltDB
//!
//! The persistent key-value storage core of a database node: a
//! **Log-Structured Merge-tree (LSM)** engine with write-ahead logging,
//! bloom-filter-accelerated reads, and background compaction. Keys and
//! values are opaque bytes; durability follows a configurable sync policy.
//!
//! ## Architecture
//!
//! ```text
//! put / delete ──► WAL (append + sync policy) ──► active memtable
//!                                                      │ rotation
//!                                               immutable memtables
//!                                                      │ flush worker
//!                                               SSTables (L0..Lk)
//!                                                      │ compaction worker
//!                                               fewer, larger SSTables
//! ```
//!
//! Reads search newest-first: active memtable → immutable memtables →
//! SSTables. Tombstones shadow older layers, so a delete is visible the
//! moment it is acknowledged.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Public surface — open, put, get, delete, flush, compact, stats, close |
//! | [`wal`] | Append-only durable log with CRC records, rotation, and replay |
//! | [`memtable`] | Sorted in-memory write buffer with size accounting |
//! | [`sstable`] | Immutable sorted tables with sparse index and bloom filter |
//! | [`bloom`] | Double-hashed bloom filter backing SSTable point lookups |
//! | [`compaction`] | Size-tiered / leveled / hybrid planning and merge execution |
//! | [`checkpoint`] | Named sequence checkpoints gating WAL cleanup |
//! | [`manifest`] | Durable list of live SSTables, their levels, and the id counter |
//! | [`config`] | Engine configuration and validation |
//!
//! ## Durability contract
//!
//! Acknowledged writes are durable under `Sync` mode, and under `Group`
//! mode once the call returns after a sync boundary. Under `Async` the
//! final window before a crash may be lost. Recovery replays the WAL,
//! discarding a corrupt or truncated tail, and never resurrects data a
//! tombstone has deleted.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use basaltdb::{Engine, EngineConfig};
//!
//! let engine = Engine::open("/tmp/my_store", EngineConfig::default())?;
//!
//! engine.put(b"hello", b"world")?;
//! assert_eq!(engine.get(b"hello")?, Some(b"world".to_vec()));
//!
//! engine.delete(b"hello")?;
//! assert_eq!(engine.get(b"hello")?, None);
//!
//! engine.close()?;
//! # Ok::<(), basaltdb::EngineError>(())
//! ```

pub mod bloom;
pub mod checkpoint;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use config::{CompactionStrategyKind, EngineConfig, SyncMode};
pub use engine::{Engine, EngineError, EngineStats};
