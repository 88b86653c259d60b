//! MemTable — the in-memory, sorted write buffer.
//!
//! Keys map to their latest mutation only: a newer put or tombstone
//! replaces the older entry outright (the WAL retains full history until
//! cleanup; SSTables hold flushed history). Tombstones are first-class
//! entries, distinct from empty values, so a flushed table can shadow
//! older data on disk.
//!
//! Byte-wise key order is the crate-wide key order: lexicographic over
//! unsigned bytes, with a shorter key sorting before any longer key it
//! prefixes — exactly the `Ord` of `[u8]`, which `BTreeMap<Vec<u8>, _>`
//! provides for free.
//!
//! # Size accounting
//!
//! The aggregate size is the sum of key and value bytes; tombstones count
//! at key size. Overwrites subtract the replaced value's size, so the
//! accounted size tracks live content, not write volume. Crossing the
//! configured threshold reports "should flush" to the caller; the engine
//! then rotates this table into the immutable queue.
//!
//! # Concurrency
//!
//! Mutation goes through the engine's writer lane; reads may arrive from
//! any thread at any time. The interior `RwLock` keeps readers concurrent
//! with each other and consistent with writers. After rotation the engine
//! simply stops writing to the table — an immutable snapshot is nothing
//! more than an `Arc<MemTable>` that no longer receives writes.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::engine::utils::Record;

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemTableGet {
    /// The key has a live value.
    Present(Vec<u8>),
    /// The key was deleted; the tombstone shadows older layers.
    Tombstone,
    /// This table knows nothing about the key.
    Absent,
}

#[derive(Debug, Clone)]
struct MemEntry {
    seq: u64,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

struct MemTableInner {
    tree: BTreeMap<Vec<u8>, MemEntry>,
    size_bytes: usize,
    highest_seq: u64,
}

/// Sorted in-memory map of key → latest mutation.
pub struct MemTable {
    inner: RwLock<MemTableInner>,
    threshold: usize,
}

impl MemTable {
    /// Creates an empty table that reports "should flush" once its
    /// accounted size reaches `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            inner: RwLock::new(MemTableInner {
                tree: BTreeMap::new(),
                size_bytes: 0,
                highest_seq: 0,
            }),
            threshold,
        }
    }

    /// Inserts or overwrites `key`. Returns `true` when the table has
    /// crossed its flush threshold.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> bool {
        self.insert(key, Some(value), seq)
    }

    /// Records a tombstone for `key`. Returns `true` when the table has
    /// crossed its flush threshold.
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> bool {
        self.insert(key, None, seq)
    }

    /// Applies a replayed WAL record. Used during recovery.
    pub fn apply(&self, record: Record) -> bool {
        match record {
            Record::Put { key, value, seq } => self.put(key, value, seq),
            Record::Delete { key, seq } => self.delete(key, seq),
        }
    }

    fn insert(&self, key: Vec<u8>, value: Option<Vec<u8>>, seq: u64) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let key_len = key.len();
        let new_value_len = value.as_ref().map_or(0, Vec::len);
        match inner.tree.insert(key, MemEntry { seq, value }) {
            Some(old) => {
                // Key bytes are already accounted; swap the value size.
                let old_value_len = old.value.as_ref().map_or(0, Vec::len);
                inner.size_bytes = inner.size_bytes - old_value_len + new_value_len;
            }
            None => {
                inner.size_bytes += key_len + new_value_len;
            }
        }
        inner.highest_seq = inner.highest_seq.max(seq);

        inner.size_bytes >= self.threshold
    }

    /// Returns `true` when inserting `key` with a value of `value_len`
    /// bytes would put the table at or past its flush threshold. The
    /// engine's backpressure gate calls this before touching the WAL.
    pub fn would_exceed(&self, key: &[u8], value_len: usize) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let added = match inner.tree.get(key) {
            Some(old) => value_len.saturating_sub(old.value.as_ref().map_or(0, Vec::len)),
            None => key.len() + value_len,
        };
        inner.size_bytes + added >= self.threshold
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> MemTableGet {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match inner.tree.get(key) {
            Some(MemEntry {
                value: Some(value), ..
            }) => MemTableGet::Present(value.clone()),
            Some(MemEntry { value: None, .. }) => MemTableGet::Tombstone,
            None => MemTableGet::Absent,
        }
    }

    /// All entries in ascending key order, as flush-ready records.
    ///
    /// The returned iterator is a point-in-time snapshot; it is finite and
    /// cannot be restarted.
    pub fn iter_sorted(&self) -> impl Iterator<Item = Record> + 'static {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let records: Vec<Record> = inner
            .tree
            .iter()
            .map(|(key, entry)| match &entry.value {
                Some(value) => Record::Put {
                    key: key.clone(),
                    value: value.clone(),
                    seq: entry.seq,
                },
                None => Record::Delete {
                    key: key.clone(),
                    seq: entry.seq,
                },
            })
            .collect();
        records.into_iter()
    }

    /// Accounted size in bytes (keys + live values).
    pub fn size_bytes(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .size_bytes
    }

    /// Number of distinct keys (tombstones included).
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tree
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest sequence number applied to this table, 0 when empty.
    pub fn highest_seq(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .highest_seq
    }
}
