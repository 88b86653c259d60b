//! Manifest — the durable record of which SSTables are live.
//!
//! Startup cannot tell a published SSTable from a crashed compaction's
//! half-adopted output by looking at the `sst/` directory alone; the
//! manifest is the authority. It also persists each table's level, the
//! monotonic SSTable id counter, and the highest sequence number ever
//! flushed (so a reopened engine never re-issues sequence numbers even
//! after WAL cleanup).
//!
//! Mutations are rare — one per flush or compaction publish — so the
//! whole state is rewritten atomically each time: serialize to
//! `MANIFEST.tmp`, fsync, rename over `MANIFEST`, fsync the directory.
//!
//! # File format (little-endian)
//!
//! ```text
//! [magic u32][version u32][last_seq u64][next_sst_id u64]
//! [count u32] then per table: [id u64][level u32][max_seq u64]
//! [crc u32]   — CRC32 over all preceding bytes
//! ```
//!
//! `max_seq` is the highest sequence number a table can contain. The
//! engine orders its read path by it, so it must never understate.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info};

const MANIFEST_MAGIC: u32 = 0x4253_4D46;
const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILENAME: &str = "MANIFEST";
const TMP_SUFFIX: &str = ".tmp";

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The manifest file failed checksum or structural validation.
    #[error("corrupt manifest: {0}")]
    Corrupt(String),
}

/// One live SSTable as recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestTable {
    pub id: u64,
    pub level: u32,
    /// Upper bound on the sequence numbers stored in this table.
    pub max_seq: u64,
}

/// In-memory manifest state plus its on-disk location.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    last_seq: u64,
    next_sst_id: u64,
    tables: Vec<ManifestTable>,
}

impl Manifest {
    /// Loads the manifest in `dir`, or initializes an empty one when the
    /// file does not exist (a fresh store).
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = dir.as_ref().join(MANIFEST_FILENAME);

        if !path.exists() {
            info!(path = %path.display(), "no manifest found, starting empty");
            return Ok(Self {
                path,
                last_seq: 0,
                next_sst_id: 1,
                tables: Vec::new(),
            });
        }

        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        let (last_seq, next_sst_id, tables) = decode(&bytes)?;

        debug!(
            path = %path.display(),
            last_seq,
            next_sst_id,
            table_count = tables.len(),
            "manifest loaded"
        );
        Ok(Self {
            path,
            last_seq,
            next_sst_id,
            tables,
        })
    }

    /// Highest sequence number ever recorded by a flush.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// The live tables, in recorded order.
    pub fn tables(&self) -> &[ManifestTable] {
        &self.tables
    }

    /// Returns `true` when `id` is a live table.
    pub fn contains(&self, id: u64) -> bool {
        self.tables.iter().any(|t| t.id == id)
    }

    /// Allocates the next SSTable id. The counter only moves forward, so
    /// ids are never reused within a store's lifetime.
    pub fn allocate_sst_id(&mut self) -> u64 {
        let id = self.next_sst_id;
        self.next_sst_id += 1;
        id
    }

    /// Records a freshly flushed table at level 0 and persists.
    pub fn publish_flush(&mut self, id: u64, flushed_seq: u64) -> Result<(), ManifestError> {
        self.tables.push(ManifestTable {
            id,
            level: 0,
            max_seq: flushed_seq,
        });
        self.last_seq = self.last_seq.max(flushed_seq);
        self.persist()
    }

    /// Applies a compaction: removes the consumed tables, records the
    /// output (if any survived the merge), and persists.
    pub fn apply_compaction(
        &mut self,
        removed: &[u64],
        added: Option<ManifestTable>,
    ) -> Result<(), ManifestError> {
        self.tables.retain(|t| !removed.contains(&t.id));
        if let Some(table) = added {
            self.tables.push(table);
        }
        self.persist()
    }

    /// Rewrites the manifest file atomically.
    fn persist(&self) -> Result<(), ManifestError> {
        let bytes = encode(self.last_seq, self.next_sst_id, &self.tables);

        let tmp_path = {
            let mut os = self.path.as_os_str().to_os_string();
            os.push(TMP_SUFFIX);
            PathBuf::from(os)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }

        debug!(
            last_seq = self.last_seq,
            table_count = self.tables.len(),
            "manifest persisted"
        );
        Ok(())
    }
}

fn encode(last_seq: u64, next_sst_id: u64, tables: &[ManifestTable]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32 + tables.len() * 20);
    bytes.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
    bytes.extend_from_slice(&last_seq.to_le_bytes());
    bytes.extend_from_slice(&next_sst_id.to_le_bytes());
    bytes.extend_from_slice(&(tables.len() as u32).to_le_bytes());
    for table in tables {
        bytes.extend_from_slice(&table.id.to_le_bytes());
        bytes.extend_from_slice(&table.level.to_le_bytes());
        bytes.extend_from_slice(&table.max_seq.to_le_bytes());
    }

    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
    bytes
}

fn decode(bytes: &[u8]) -> Result<(u64, u64, Vec<ManifestTable>), ManifestError> {
    let corrupt = |what: &str| ManifestError::Corrupt(what.to_string());

    if bytes.len() < 4 + 4 + 8 + 8 + 4 + 4 {
        return Err(corrupt("file too small"));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("fixed slice"));
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(corrupt("checksum mismatch"));
    }

    let magic = u32::from_le_bytes(body[0..4].try_into().expect("fixed slice"));
    let version = u32::from_le_bytes(body[4..8].try_into().expect("fixed slice"));
    if magic != MANIFEST_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if version != MANIFEST_VERSION {
        return Err(corrupt("unsupported version"));
    }

    let last_seq = u64::from_le_bytes(body[8..16].try_into().expect("fixed slice"));
    let next_sst_id = u64::from_le_bytes(body[16..24].try_into().expect("fixed slice"));
    let count = u32::from_le_bytes(body[24..28].try_into().expect("fixed slice")) as usize;

    if body.len() != 28 + count * 20 {
        return Err(corrupt("table list length mismatch"));
    }

    let mut tables = Vec::with_capacity(count);
    let mut cursor = 28usize;
    for _ in 0..count {
        let id = u64::from_le_bytes(body[cursor..cursor + 8].try_into().expect("fixed slice"));
        let level =
            u32::from_le_bytes(body[cursor + 8..cursor + 12].try_into().expect("fixed slice"));
        let max_seq =
            u64::from_le_bytes(body[cursor + 12..cursor + 20].try_into().expect("fixed slice"));
        tables.push(ManifestTable { id, level, max_seq });
        cursor += 20;
    }

    Ok((last_seq, next_sst_id, tables))
}
