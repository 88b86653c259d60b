//! Write-Ahead Log — durable, append-only record of every mutation.
//!
//! Every `put`/`delete` is appended (and, depending on the sync mode,
//! fsynced) here before the in-memory state is touched. On startup the
//! segments are replayed to rebuild the memtable contents that never made
//! it into an SSTable.
//!
//! # On-disk layout
//!
//! The log lives in its own directory as a series of segment files named
//! `wal-<timestamp>-<start_seq>.log`, both fields zero-padded so that
//! lexicographic order is chronological order. Exactly one segment — the
//! one with the highest start sequence — is open for appends.
//!
//! Segment format (all integers little-endian):
//!
//! ```text
//! [magic u32 = 0x57414C4F][version u16][flags u16][created_ms u64]   16-byte header
//! [op u8][seq u64][key_len i32][value_len i32][key][value?][crc u32] record
//! [op u8][seq u64][key_len i32][value_len i32][key][value?][crc u32]
//! ...
//! ```
//!
//! `value_len` is `-1` for DELETE records, which carry no value bytes. The
//! CRC32 covers every preceding byte of the record.
//!
//! # Durability
//!
//! Three sync modes ([`SyncMode`]):
//!
//! - `Sync` — fsync per append; a returned call is durable.
//! - `Async` — no explicit fsync; the final window may be lost on power
//!   failure.
//! - `Group` — fsync when either `group_size` records are uncommitted or
//!   `group_interval` has elapsed since the last sync (the engine's timer
//!   thread enforces the time bound). Calls returning after a sync
//!   boundary are durable.
//!
//! # Recovery & cleanup
//!
//! [`Wal::replay_dir`] walks segments in sequence order, verifying header
//! magic/version and per-record CRCs. A corrupt or truncated record stops
//! that segment — the remainder is discarded with a warning, never
//! synthesized — and replay continues with the next segment.
//!
//! [`Wal::cleanup_up_to`] deletes closed segments once every sequence they
//! contain is both flushed and released by the checkpoint manager. The
//! active segment is never deleted.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::SyncMode;
use crate::engine::utils::Record;

/// Magic constant identifying WAL segment files (`"OLAW"` on disk, read
/// back as `0x57414C4F` little-endian).
pub const WAL_MAGIC: u32 = 0x5741_4C4F;

/// Current segment format version.
pub const WAL_VERSION: u16 = 1;

/// Size of the fixed segment header in bytes.
pub const WAL_HEADER_SIZE: usize = 16;

/// Size of the fixed per-record prelude: op + seq + key_len + value_len.
const RECORD_PRELUDE_SIZE: usize = 1 + 8 + 4 + 4;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Upper bound on a single key or value accepted during replay. Lengths
/// beyond this are treated as tail corruption rather than allocated.
const MAX_REPLAY_LEN: i32 = 256 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header or record failed integrity validation.
    #[error("corrupt WAL: {0}")]
    Corrupt(String),

    /// Caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Tunables carried over from the engine configuration.
#[derive(Debug, Clone)]
pub struct WalOptions {
    pub sync_mode: SyncMode,
    pub max_segment_bytes: u64,
    pub group_size: usize,
    pub group_interval: Duration,
}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// The write-ahead log: one active segment plus the closed segments that
/// cleanup has not yet reclaimed.
///
/// All appends go through an internal mutex; the engine's writer lane
/// additionally serializes appends with memtable inserts so sequence
/// numbers and insertion order always agree.
pub struct Wal {
    dir: PathBuf,
    opts: WalOptions,
    checkpoints: Arc<CheckpointManager>,
    inner: Mutex<WalInner>,
}

struct WalInner {
    file: File,
    path: PathBuf,
    bytes_written: u64,
    /// Next sequence number to assign.
    next_seq: u64,
    /// Records appended since the last fsync (group mode accounting).
    uncommitted: usize,
    last_sync: Instant,
}

impl Wal {
    /// Creates the WAL directory if needed and opens a fresh active
    /// segment whose first record will carry `next_seq`.
    ///
    /// Existing segments are left untouched — the caller replays them via
    /// [`Wal::replay_dir`] *before* opening, and cleanup reclaims them once
    /// their contents are flushed.
    pub fn open(
        dir: impl AsRef<Path>,
        next_seq: u64,
        opts: WalOptions,
        checkpoints: Arc<CheckpointManager>,
    ) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let (file, path) = create_segment(&dir, next_seq)?;
        info!(path = %path.display(), next_seq, "WAL opened");

        Ok(Self {
            dir,
            opts,
            checkpoints,
            inner: Mutex::new(WalInner {
                file,
                path,
                bytes_written: WAL_HEADER_SIZE as u64,
                next_seq,
                uncommitted: 0,
                last_sync: Instant::now(),
            }),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, WalInner> {
        // A poisoning panic can only originate from an I/O error path that
        // already surfaced to some caller; the file state itself is valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a PUT record and returns its sequence number.
    pub fn log_put(&self, key: &[u8], value: &[u8]) -> Result<u64, WalError> {
        if key.is_empty() {
            return Err(WalError::InvalidArgument("empty key".into()));
        }
        self.append(OP_PUT, key, Some(value))
    }

    /// Appends a DELETE record and returns its sequence number.
    pub fn log_delete(&self, key: &[u8]) -> Result<u64, WalError> {
        if key.is_empty() {
            return Err(WalError::InvalidArgument("empty key".into()));
        }
        self.append(OP_DELETE, key, None)
    }

    fn append(&self, op: u8, key: &[u8], value: Option<&[u8]>) -> Result<u64, WalError> {
        let mut buf = Vec::with_capacity(
            RECORD_PRELUDE_SIZE + key.len() + value.map_or(0, <[u8]>::len) + 4,
        );

        let mut inner = self.lock_inner();
        let seq = inner.next_seq;

        buf.push(op);
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(&(key.len() as i32).to_le_bytes());
        match value {
            Some(v) => buf.extend_from_slice(&(v.len() as i32).to_le_bytes()),
            None => buf.extend_from_slice(&(-1i32).to_le_bytes()),
        }
        buf.extend_from_slice(key);
        if let Some(v) = value {
            buf.extend_from_slice(v);
        }

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        inner.file.write_all(&buf)?;
        inner.next_seq = seq + 1;
        inner.bytes_written += buf.len() as u64;
        inner.uncommitted += 1;

        match self.opts.sync_mode {
            SyncMode::Sync => {
                sync_locked(&mut inner)?;
            }
            SyncMode::Async => {}
            SyncMode::Group => {
                if inner.uncommitted >= self.opts.group_size
                    || inner.last_sync.elapsed() >= self.opts.group_interval
                {
                    sync_locked(&mut inner)?;
                }
            }
        }

        if inner.bytes_written >= self.opts.max_segment_bytes {
            self.rotate_locked(&mut inner)?;
        }

        trace!(seq, op, len = buf.len(), "WAL record appended");
        Ok(seq)
    }

    /// Flushes and fsyncs the active segment.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut inner = self.lock_inner();
        sync_locked(&mut inner)
    }

    /// Issues the time-bound group-commit fsync if one is due. Called
    /// periodically by the engine's timer thread under [`SyncMode::Group`].
    pub fn maybe_group_sync(&self) -> Result<(), WalError> {
        if self.opts.sync_mode != SyncMode::Group {
            return Ok(());
        }
        let mut inner = self.lock_inner();
        if inner.uncommitted > 0 && inner.last_sync.elapsed() >= self.opts.group_interval {
            sync_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Closes the current segment and opens a new one.
    pub fn rotate(&self) -> Result<(), WalError> {
        let mut inner = self.lock_inner();
        self.rotate_locked(&mut inner)
    }

    fn rotate_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        if inner.bytes_written == WAL_HEADER_SIZE as u64 {
            // Empty segment — rotating would create a same-named twin.
            return Ok(());
        }
        sync_locked(inner)?;

        let (file, path) = create_segment(&self.dir, inner.next_seq)?;
        info!(
            old = %inner.path.display(),
            new = %path.display(),
            start_seq = inner.next_seq,
            "WAL segment rotated"
        );

        inner.file = file;
        inner.path = path;
        inner.bytes_written = WAL_HEADER_SIZE as u64;
        inner.uncommitted = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    /// Registers a named checkpoint at the last assigned sequence and
    /// returns that sequence.
    pub fn checkpoint(&self, name: &str) -> u64 {
        let seq = self.last_seq();
        self.checkpoints.register(name, seq);
        seq
    }

    /// Removes a named checkpoint.
    pub fn remove_checkpoint(&self, name: &str) {
        self.checkpoints.remove(name);
    }

    /// Deletes closed segments whose highest contained sequence is at or
    /// below `min(seq, minimum registered checkpoint)`. The active segment
    /// is never touched.
    pub fn cleanup_up_to(&self, seq: u64) -> Result<usize, WalError> {
        let bound = self.checkpoints.clamp(seq);
        let active_path = self.lock_inner().path.clone();

        let segments = list_segments(&self.dir)?;
        let mut removed = 0usize;

        // A closed segment's highest sequence is one less than the next
        // segment's start sequence.
        for window in segments.windows(2) {
            let (segment, next) = (&window[0], &window[1]);
            if segment.path == active_path {
                continue;
            }
            let highest = next.start_seq.saturating_sub(1);
            if highest <= bound {
                fs::remove_file(&segment.path)?;
                removed += 1;
                info!(path = %segment.path.display(), highest, bound, "WAL segment reclaimed");
            }
        }

        Ok(removed)
    }

    /// The last sequence number assigned, or 0 when nothing was appended.
    pub fn last_seq(&self) -> u64 {
        self.lock_inner().next_seq.saturating_sub(1)
    }

    /// Number of segment files currently on disk (including the active one).
    pub fn segment_count(&self) -> Result<usize, WalError> {
        Ok(list_segments(&self.dir)?.len())
    }

    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    /// Replays every segment in `dir` in sequence order, feeding each valid
    /// record to `consumer`. Returns the highest sequence observed (0 when
    /// the directory holds no records).
    ///
    /// A corrupt header skips the whole segment; a corrupt or truncated
    /// record abandons the remainder of its segment. Both log a warning
    /// and replay continues with the next segment.
    pub fn replay_dir(
        dir: impl AsRef<Path>,
        mut consumer: impl FnMut(Record),
    ) -> Result<u64, WalError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(0);
        }

        let mut highest = 0u64;
        for segment in list_segments(dir)? {
            let replayed = replay_segment(&segment.path, &mut consumer)?;
            highest = highest.max(replayed);
        }

        debug!(dir = %dir.display(), highest, "WAL replay finished");
        Ok(highest)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let mut inner = self.lock_inner();
        if let Err(e) = sync_locked(&mut inner) {
            warn!(path = %inner.path.display(), error = %e, "WAL sync failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Segment files
// ------------------------------------------------------------------------------------------------

/// A parsed segment file name.
#[derive(Debug, Clone)]
struct SegmentRef {
    path: PathBuf,
    start_seq: u64,
}

fn segment_file_name(created_ms: u64, start_seq: u64) -> String {
    format!("wal-{created_ms:013}-{start_seq:020}.log")
}

fn parse_segment_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("wal-")?.strip_suffix(".log")?;
    let (_, start_seq) = rest.split_once('-')?;
    start_seq.parse::<u64>().ok()
}

/// Lists segment files sorted by start sequence (chronological order).
fn list_segments(dir: &Path) -> Result<Vec<SegmentRef>, WalError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && let Some(start_seq) = parse_segment_name(name)
        {
            segments.push(SegmentRef { path, start_seq });
        }
    }
    segments.sort_by_key(|s| s.start_seq);
    Ok(segments)
}

/// Creates and syncs a new segment file with its header in place.
fn create_segment(dir: &Path, start_seq: u64) -> Result<(File, PathBuf), WalError> {
    let mut created_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    // A reopen within the same millisecond would collide with the
    // previous segment of the same start sequence; nudge the timestamp
    // until the name is free.
    let (mut file, path) = loop {
        let path = dir.join(segment_file_name(created_ms, start_seq));
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(file) => break (file, path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                created_ms += 1;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut header = [0u8; WAL_HEADER_SIZE];
    header[0..4].copy_from_slice(&WAL_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
    header[6..8].copy_from_slice(&0u16.to_le_bytes()); // flags
    header[8..16].copy_from_slice(&created_ms.to_le_bytes());
    file.write_all(&header)?;
    file.sync_all()?;

    // Make the new directory entry durable as well.
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    Ok((file, path))
}

fn sync_locked(inner: &mut WalInner) -> Result<(), WalError> {
    inner.file.sync_all()?;
    inner.uncommitted = 0;
    inner.last_sync = Instant::now();
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Segment replay
// ------------------------------------------------------------------------------------------------

/// Replays one segment, returning the highest sequence it contributed.
fn replay_segment(path: &Path, consumer: &mut impl FnMut(Record)) -> Result<u64, WalError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; WAL_HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            warn!(path = %path.display(), "WAL segment shorter than header, skipping");
            return Ok(0);
        }
        return Err(e.into());
    }

    let magic = u32::from_le_bytes(header[0..4].try_into().expect("fixed slice"));
    let version = u16::from_le_bytes(header[4..6].try_into().expect("fixed slice"));
    if magic != WAL_MAGIC {
        warn!(path = %path.display(), magic, "WAL segment magic mismatch, skipping");
        return Ok(0);
    }
    if version != WAL_VERSION {
        warn!(path = %path.display(), version, "WAL segment version unsupported, skipping");
        return Ok(0);
    }

    let mut highest = 0u64;
    let mut offset = WAL_HEADER_SIZE as u64;
    loop {
        match read_record(&mut reader) {
            Ok(Some((record, len))) => {
                highest = highest.max(record.seq());
                offset += len;
                consumer(record);
            }
            Ok(None) => break,
            Err(reason) => {
                warn!(
                    path = %path.display(),
                    offset,
                    %reason,
                    "corrupt WAL tail, discarding remainder of segment"
                );
                break;
            }
        }
    }

    debug!(path = %path.display(), highest, "WAL segment replayed");
    Ok(highest)
}

/// Reads one record. `Ok(None)` is a clean end of segment; `Err` is a
/// corrupt or truncated tail (the error is a human-readable reason, not
/// a propagated failure — the caller downgrades it to a warning).
fn read_record(reader: &mut impl Read) -> Result<Option<(Record, u64)>, String> {
    let mut prelude = [0u8; RECORD_PRELUDE_SIZE];
    match reader.read_exact(&mut prelude) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(format!("read failed: {e}")),
    }

    let op = prelude[0];
    let seq = u64::from_le_bytes(prelude[1..9].try_into().expect("fixed slice"));
    let key_len = i32::from_le_bytes(prelude[9..13].try_into().expect("fixed slice"));
    let value_len = i32::from_le_bytes(prelude[13..17].try_into().expect("fixed slice"));

    if !(op == OP_PUT || op == OP_DELETE) {
        return Err(format!("unknown op {op}"));
    }
    if key_len <= 0 || key_len > MAX_REPLAY_LEN {
        return Err(format!("implausible key length {key_len}"));
    }
    match (op, value_len) {
        (OP_PUT, v) if (0..=MAX_REPLAY_LEN).contains(&v) => {}
        (OP_DELETE, -1) => {}
        (_, v) => return Err(format!("implausible value length {v}")),
    }

    let mut key = vec![0u8; key_len as usize];
    reader
        .read_exact(&mut key)
        .map_err(|e| format!("truncated key: {e}"))?;

    let value = if op == OP_PUT {
        let mut value = vec![0u8; value_len as usize];
        reader
            .read_exact(&mut value)
            .map_err(|e| format!("truncated value: {e}"))?;
        Some(value)
    } else {
        None
    };

    let mut crc_bytes = [0u8; 4];
    reader
        .read_exact(&mut crc_bytes)
        .map_err(|e| format!("truncated checksum: {e}"))?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Crc32::new();
    hasher.update(&prelude);
    hasher.update(&key);
    if let Some(v) = &value {
        hasher.update(v);
    }
    if hasher.finalize() != stored_crc {
        return Err("checksum mismatch".into());
    }

    let total_len = (RECORD_PRELUDE_SIZE + key.len() + value.as_ref().map_or(0, Vec::len) + 4) as u64;
    let record = match value {
        Some(value) => Record::Put { key, value, seq },
        None => Record::Delete { key, seq },
    };
    Ok(Some((record, total_len)))
}
