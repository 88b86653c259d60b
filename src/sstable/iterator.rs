//! Ordered scan over a single SSTable.
//!
//! [`SstIter`] walks the data block record by record, lazily, straight off
//! the memory map. It holds a reference-counted handle on its table, so a
//! scan stays valid even after compaction unlinks the file.
//!
//! Records before the requested start key are skipped; everything from the
//! first key ≥ start to the end of the table is yielded in key order. A
//! malformed record ends the iteration with a warning — higher layers
//! treat the table as exhausted rather than panicking mid-scan.

use std::sync::Arc;

use tracing::warn;

use crate::engine::utils::Record;

use super::{SsTable, decode_record};

/// Lazy, finite, non-restartable forward scan over one SSTable.
pub struct SstIter {
    table: Arc<SsTable>,
    offset: u64,
    start: Vec<u8>,
    /// Set once the first in-range record has been yielded; earlier
    /// records no longer need the start-key comparison.
    past_start: bool,
}

impl SstIter {
    pub(crate) fn new(table: Arc<SsTable>, offset: u64, start: Vec<u8>) -> Self {
        Self {
            table,
            offset,
            start,
            past_start: false,
        }
    }
}

impl Iterator for SstIter {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset < self.table.data_end {
            let (record, next) = match decode_record(&self.table.mmap, self.offset, self.table.data_end)
            {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(sst_id = self.table.id, offset = self.offset, error = %e, "scan aborted");
                    self.offset = self.table.data_end;
                    return None;
                }
            };
            self.offset = next;

            if !self.past_start {
                if record.key() < self.start.as_slice() {
                    continue;
                }
                self.past_start = true;
            }
            return Some(record);
        }
        None
    }
}
