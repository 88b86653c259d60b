//! SSTable writer — builds a complete table from a sorted record stream.
//!
//! The writer consumes records in ascending key order (one version per
//! key — flush and compaction both deduplicate before writing), recording
//! every k-th record's offset in the sparse index and feeding every key to
//! the bloom filter. At the end it writes index, bloom filter, and footer,
//! fsyncs, and renames `<path>.tmp` into place.
//!
//! # Atomicity
//!
//! Everything goes to a temporary file first; the rename happens only
//! after a successful `fsync`, and the containing directory is synced
//! afterwards. A crash mid-build leaves a `.tmp` file that startup
//! removes — a partially-written table is never observable under its
//! final name.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::engine::utils::Record;

use super::{OP_DELETE, OP_PUT, SST_FOOTER_SIZE, SST_MAGIC, SST_VERSION, SsTableError};

/// Build-time tunables, carried over from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct SstWriteOptions {
    /// Records between sparse-index entries.
    pub index_interval: usize,
    /// Bloom filter target false-positive rate.
    pub bloom_target_fp: f64,
}

/// Builds one SSTable file.
pub struct SstWriter {
    path: PathBuf,
    opts: SstWriteOptions,
}

impl SstWriter {
    /// Creates a writer targeting `path` (the *final* name; the writer
    /// manages its own `.tmp` sibling).
    pub fn new(path: impl AsRef<Path>, opts: SstWriteOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            opts,
        }
    }

    /// Consumes a key-ordered record stream and writes the complete table.
    ///
    /// `expected_count` sizes the bloom filter; passing the exact record
    /// count gives the configured false-positive rate.
    ///
    /// Fails with [`SsTableError::Corrupt`] if the stream is empty or out
    /// of order — both indicate a bug in the caller, and neither may
    /// produce a file.
    pub fn build(
        self,
        records: impl Iterator<Item = Record>,
        expected_count: usize,
    ) -> Result<(), SsTableError> {
        let tmp_path = tmp_path_for(&self.path);
        let result = self.build_inner(records, expected_count, &tmp_path);
        if result.is_err() {
            // Leave no trace of a failed build.
            if let Err(e) = fs::remove_file(&tmp_path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %tmp_path.display(), error = %e, "failed to remove abandoned SSTable build");
            }
        }
        result
    }

    fn build_inner(
        &self,
        records: impl Iterator<Item = Record>,
        expected_count: usize,
        tmp_path: &Path,
    ) -> Result<(), SsTableError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut writer = BufWriter::new(file);

        let mut bloom = BloomFilter::new(expected_count.max(1), self.opts.bloom_target_fp);
        let mut index: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut offset = 0u64;
        let mut count = 0usize;
        let mut last_key: Option<Vec<u8>> = None;

        for record in records {
            if let Some(last) = &last_key
                && record.key() <= last.as_slice()
            {
                return Err(SsTableError::Corrupt(
                    "record stream not in strictly ascending key order".into(),
                ));
            }

            if count % self.opts.index_interval == 0 {
                index.push((record.key().to_vec(), offset));
            }
            bloom.insert(record.key());

            offset += write_record(&mut writer, &record)?;
            last_key = Some(record.key().to_vec());
            count += 1;
        }

        if count == 0 {
            return Err(SsTableError::Corrupt(
                "refusing to build an empty SSTable".into(),
            ));
        }

        let data_end = offset;

        // Sparse index block.
        writer.write_all(&(index.len() as u32).to_le_bytes())?;
        offset += 4;
        for (key, record_offset) in &index {
            writer.write_all(&(key.len() as u32).to_le_bytes())?;
            writer.write_all(key)?;
            writer.write_all(&record_offset.to_le_bytes())?;
            offset += 4 + key.len() as u64 + 8;
        }
        let index_end = offset;

        // Bloom filter block.
        bloom.write_to(&mut writer)?;
        offset += bloom.serialized_len() as u64;
        let bloom_end = offset;

        // Footer, zero-padded to its fixed size.
        let mut footer = [0u8; SST_FOOTER_SIZE];
        footer[0..8].copy_from_slice(&data_end.to_le_bytes());
        footer[8..16].copy_from_slice(&index_end.to_le_bytes());
        footer[16..24].copy_from_slice(&bloom_end.to_le_bytes());
        footer[24..28].copy_from_slice(&SST_VERSION.to_le_bytes());
        footer[28..32].copy_from_slice(&SST_MAGIC.to_le_bytes());
        writer.write_all(&footer)?;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| SsTableError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(tmp_path, &self.path)?;
        sync_parent_dir(&self.path);

        debug!(
            path = %self.path.display(),
            records = count,
            index_entries = index.len(),
            bytes = bloom_end + SST_FOOTER_SIZE as u64,
            "SSTable built"
        );
        Ok(())
    }
}

/// `<path>.tmp` — the in-progress build name for a table at `path`.
fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

fn write_record(writer: &mut impl Write, record: &Record) -> Result<u64, SsTableError> {
    let (op, key, value) = match record {
        Record::Put { key, value, .. } => (OP_PUT, key, Some(value)),
        Record::Delete { key, .. } => (OP_DELETE, key, None),
    };

    writer.write_all(&[op])?;
    writer.write_all(&record.seq().to_le_bytes())?;
    writer.write_all(&(key.len() as i32).to_le_bytes())?;
    match value {
        Some(v) => writer.write_all(&(v.len() as i32).to_le_bytes())?,
        None => writer.write_all(&(-1i32).to_le_bytes())?,
    }
    writer.write_all(key)?;
    if let Some(v) = value {
        writer.write_all(v)?;
    }

    Ok((super::RECORD_PRELUDE_SIZE + key.len() + value.map_or(0, |v| v.len())) as u64)
}

fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
        && let Err(e) = dir.sync_all()
    {
        warn!(dir = %parent.display(), error = %e, "directory sync failed after SSTable publish");
    }
}
