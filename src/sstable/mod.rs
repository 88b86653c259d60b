//! SSTable — immutable, sorted on-disk table with index and bloom filter.
//!
//! An SSTable is born exactly once — from a memtable flush or a compaction
//! merge — and never modified afterwards. Readers memory-map the file;
//! immutability makes every read lock-free.
//!
//! # On-disk layout (all integers little-endian)
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ data block: sorted records   │
//! ├──────────────────────────────┤ data_end
//! │ sparse index                 │   every k-th record: key + offset
//! ├──────────────────────────────┤ index_end
//! │ bloom filter                 │   over the full key set
//! ├──────────────────────────────┤ bloom_end
//! │ footer (64 bytes)            │
//! └──────────────────────────────┘ file end
//! ```
//!
//! Each record reuses the WAL field shape, minus the checksum:
//! `[op u8][seq u64][key_len i32][value_len i32][key][value?]`, with
//! `value_len = -1` marking a tombstone.
//!
//! The sparse index holds every k-th record's key and file offset
//! (`k = sst_index_interval`). The footer is
//! `[data_end u64][index_end u64][bloom_end u64][version u32][magic u32]`
//! padded with zeros to 64 bytes.
//!
//! # Point lookups
//!
//! `get` consults the bloom filter first; a negative answer skips the file
//! without touching record bytes. A positive answer binary-searches the
//! sparse index to bracket at most one index interval of records, then
//! scans that span linearly. The number of span reads is counted and
//! exposed — the bloom filter's hit rate is directly observable.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{SstWriteOptions, SstWriter};
pub use iterator::SstIter;

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;
use thiserror::Error;

use crate::bloom::BloomFilter;
use crate::engine::utils::Record;

/// Magic constant in the footer of every SSTable.
pub const SST_MAGIC: u32 = 0x5342_4C54;

/// Current file format version.
pub const SST_VERSION: u32 = 1;

/// Fixed footer size; the footer occupies the last bytes of the file.
pub const SST_FOOTER_SIZE: usize = 64;

/// Fixed per-record prelude: op + seq + key_len + value_len.
pub(crate) const RECORD_PRELUDE_SIZE: usize = 1 + 8 + 4 + 4;

pub(crate) const OP_PUT: u8 = 1;
pub(crate) const OP_DELETE: u8 = 2;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SsTableError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Footer, index, bloom filter, or record bytes failed validation.
    #[error("corrupt SSTable: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Lookup result
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup against a single SSTable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SstGet {
    /// The table holds a live value for the key.
    Present { value: Vec<u8>, seq: u64 },
    /// The table holds a tombstone for the key.
    Tombstone { seq: u64 },
    /// The table holds nothing for the key.
    Absent,
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

struct IndexEntry {
    key: Vec<u8>,
    offset: u64,
}

/// An open, memory-mapped SSTable.
pub struct SsTable {
    /// Unique id; also the file stem (`<id>.sst`).
    pub id: u64,
    mmap: Mmap,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    data_end: u64,
    file_size: u64,
    /// Data spans scanned by `get` — bloom-filter misses never touch one.
    data_reads: AtomicU64,
}

impl SsTable {
    /// Opens and validates the table at `path`.
    ///
    /// Footer magic, version, and block offsets are verified before any
    /// block is parsed; a table failing validation is reported as
    /// [`SsTableError::Corrupt`] and must not enter the readable set.
    pub fn open(path: impl AsRef<Path>, id: u64) -> Result<Self, SsTableError> {
        let path = path.as_ref();
        let file = File::open(path)?;

        // Safety: the file is immutable post-publish and mapped read-only;
        // all offsets are bounds-checked against the map before slicing.
        let mmap = unsafe { Mmap::map(&file)? };
        let file_size = mmap.len() as u64;

        if mmap.len() < SST_FOOTER_SIZE {
            return Err(SsTableError::Corrupt("file shorter than footer".into()));
        }

        let footer = &mmap[mmap.len() - SST_FOOTER_SIZE..];
        let data_end = u64::from_le_bytes(footer[0..8].try_into().expect("fixed slice"));
        let index_end = u64::from_le_bytes(footer[8..16].try_into().expect("fixed slice"));
        let bloom_end = u64::from_le_bytes(footer[16..24].try_into().expect("fixed slice"));
        let version = u32::from_le_bytes(footer[24..28].try_into().expect("fixed slice"));
        let magic = u32::from_le_bytes(footer[28..32].try_into().expect("fixed slice"));

        if magic != SST_MAGIC {
            return Err(SsTableError::Corrupt(format!("bad magic 0x{magic:08x}")));
        }
        if version != SST_VERSION {
            return Err(SsTableError::Corrupt(format!("unsupported version {version}")));
        }
        if data_end > index_end
            || index_end > bloom_end
            || bloom_end + SST_FOOTER_SIZE as u64 != file_size
        {
            return Err(SsTableError::Corrupt("inconsistent block offsets".into()));
        }

        let index = parse_index(&mmap[data_end as usize..index_end as usize])?;
        let bloom = BloomFilter::read_from(&mut &mmap[index_end as usize..bloom_end as usize])
            .map_err(|e| SsTableError::Corrupt(format!("bloom filter: {e}")))?;

        Ok(Self {
            id,
            mmap,
            index,
            bloom,
            data_end,
            file_size,
            data_reads: AtomicU64::new(0),
        })
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of data spans `get` has scanned since open. Lookups rejected
    /// by the bloom filter do not count.
    pub fn data_reads(&self) -> u64 {
        self.data_reads.load(Ordering::Relaxed)
    }

    /// Bloom filter membership hint for `key`.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.might_contain(key)
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<SstGet, SsTableError> {
        if !self.bloom.might_contain(key) {
            return Ok(SstGet::Absent);
        }
        let Some(span) = self.span_for_key(key) else {
            return Ok(SstGet::Absent);
        };

        self.data_reads.fetch_add(1, Ordering::Relaxed);

        let mut offset = span.0;
        while offset < span.1 {
            let (record, next) = decode_record(&self.mmap, offset, span.1)?;
            match record.key().cmp(key) {
                std::cmp::Ordering::Less => offset = next,
                std::cmp::Ordering::Equal => {
                    return Ok(match record {
                        Record::Put { value, seq, .. } => SstGet::Present { value, seq },
                        Record::Delete { seq, .. } => SstGet::Tombstone { seq },
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(SstGet::Absent)
    }

    /// Lazy ordered scan of all records with key ≥ `start`. Pass an empty
    /// slice for a full-table scan (the compactor does).
    pub fn iter_from(self: &Arc<Self>, start: &[u8]) -> SstIter {
        let offset = match self.span_for_key(start) {
            Some((offset, _)) => offset,
            // `start` sorts before the first indexed key — begin at 0 —
            // or the table is empty, which offset 0 also handles.
            None => 0,
        };
        SstIter::new(Arc::clone(self), offset, start.to_vec())
    }

    /// Brackets the index interval that may contain `key`:
    /// `(span_start, span_end)` in file offsets, or `None` when the key
    /// sorts before every indexed key (and therefore before every record).
    fn span_for_key(&self, key: &[u8]) -> Option<(u64, u64)> {
        if self.index.is_empty() {
            return None;
        }
        let after = self.index.partition_point(|e| e.key.as_slice() <= key);
        if after == 0 {
            return None;
        }
        let start = self.index[after - 1].offset;
        let end = self
            .index
            .get(after)
            .map_or(self.data_end, |next| next.offset);
        Some((start, end))
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("id", &self.id)
            .field("file_size", &self.file_size)
            .field("index_entries", &self.index.len())
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Block parsing
// ------------------------------------------------------------------------------------------------

/// Parses the sparse index block: `[count u32]` then per entry
/// `[key_len u32][key][offset u64]`.
fn parse_index(block: &[u8]) -> Result<Vec<IndexEntry>, SsTableError> {
    let corrupt = |what: &str| SsTableError::Corrupt(format!("index block: {what}"));

    if block.len() < 4 {
        return Err(corrupt("shorter than its count field"));
    }
    let count = u32::from_le_bytes(block[0..4].try_into().expect("fixed slice")) as usize;

    let mut entries: Vec<IndexEntry> = Vec::with_capacity(count.min(1 << 20));
    let mut cursor = 4usize;
    for _ in 0..count {
        if cursor + 4 > block.len() {
            return Err(corrupt("truncated key length"));
        }
        let key_len =
            u32::from_le_bytes(block[cursor..cursor + 4].try_into().expect("fixed slice")) as usize;
        cursor += 4;

        if cursor + key_len + 8 > block.len() {
            return Err(corrupt("truncated entry"));
        }
        let key = block[cursor..cursor + key_len].to_vec();
        cursor += key_len;
        let offset = u64::from_le_bytes(
            block[cursor..cursor + 8]
                .try_into()
                .expect("fixed slice"),
        );
        cursor += 8;

        if let Some(prev) = entries.last()
            && prev.key >= key
        {
            return Err(corrupt("keys not strictly ascending"));
        }
        entries.push(IndexEntry { key, offset });
    }
    if cursor != block.len() {
        return Err(corrupt("trailing bytes"));
    }
    Ok(entries)
}

/// Decodes one record at `offset`, returning it and the next offset.
pub(crate) fn decode_record(
    mmap: &Mmap,
    offset: u64,
    limit: u64,
) -> Result<(Record, u64), SsTableError> {
    let corrupt = |what: String| SsTableError::Corrupt(format!("record at {offset}: {what}"));

    let start = offset as usize;
    let limit = limit as usize;
    if start + RECORD_PRELUDE_SIZE > limit {
        return Err(corrupt("truncated prelude".into()));
    }

    let prelude = &mmap[start..start + RECORD_PRELUDE_SIZE];
    let op = prelude[0];
    let seq = u64::from_le_bytes(prelude[1..9].try_into().expect("fixed slice"));
    let key_len = i32::from_le_bytes(prelude[9..13].try_into().expect("fixed slice"));
    let value_len = i32::from_le_bytes(prelude[13..17].try_into().expect("fixed slice"));

    if key_len <= 0 {
        return Err(corrupt(format!("non-positive key length {key_len}")));
    }
    let key_len = key_len as usize;
    let value_len = match (op, value_len) {
        (OP_PUT, v) if v >= 0 => v as usize,
        (OP_DELETE, -1) => 0,
        (op, v) => return Err(corrupt(format!("op {op} with value length {v}"))),
    };

    let mut cursor = start + RECORD_PRELUDE_SIZE;
    if cursor + key_len + value_len > limit {
        return Err(corrupt("truncated payload".into()));
    }
    let key = mmap[cursor..cursor + key_len].to_vec();
    cursor += key_len;

    let record = if op == OP_PUT {
        let value = mmap[cursor..cursor + value_len].to_vec();
        cursor += value_len;
        Record::Put { key, value, seq }
    } else {
        Record::Delete { key, seq }
    };

    Ok((record, cursor as u64))
}
