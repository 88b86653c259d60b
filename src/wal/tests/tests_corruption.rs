use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::helpers::{init_tracing, open_wal, replay_all, sync_opts};
use crate::wal::WAL_HEADER_SIZE;

/// Path of the single segment in `dir`.
fn only_segment(dir: &Path) -> PathBuf {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(paths.len(), 1);
    paths.pop().unwrap()
}

fn overwrite_at(path: &Path, offset: SeekFrom, bytes: &[u8]) {
    let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
    f.seek(offset).unwrap();
    f.write_all(bytes).unwrap();
    f.sync_all().unwrap();
}

#[test]
fn corrupt_tail_drops_only_the_last_record() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"a", b"1").unwrap();
    wal.log_put(b"b", b"2").unwrap();
    wal.log_put(b"c", b"3").unwrap();
    drop(wal);

    // Flip bytes near the end of the file — inside the last record.
    let segment = only_segment(tmp.path());
    overwrite_at(&segment, SeekFrom::End(-3), &[0xDE, 0xAD, 0xBE]);

    let records = replay_all(tmp.path()).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key(), b"a");
    assert_eq!(records[1].key(), b"b");
}

#[test]
fn corruption_mid_segment_discards_the_remainder() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"a", b"1").unwrap();
    wal.log_put(b"b", b"2").unwrap();
    wal.log_put(b"c", b"3").unwrap();
    drop(wal);

    // Corrupt payload bytes of the *first* record: everything after it is
    // unreachable (record framing cannot be trusted past a bad checksum).
    let segment = only_segment(tmp.path());
    overwrite_at(
        &segment,
        SeekFrom::Start((WAL_HEADER_SIZE + 18) as u64),
        &[0xFF, 0xFF],
    );

    let records = replay_all(tmp.path()).unwrap();
    assert!(records.is_empty());
}

#[test]
fn truncated_record_is_discarded() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"a", b"1").unwrap();
    wal.log_put(b"bbbbbbbb", b"22222222").unwrap();
    drop(wal);

    // Chop off the tail of the last record, simulating a torn write.
    let segment = only_segment(tmp.path());
    let len = std::fs::metadata(&segment).unwrap().len();
    let f = OpenOptions::new().write(true).open(&segment).unwrap();
    f.set_len(len - 5).unwrap();
    f.sync_all().unwrap();

    let records = replay_all(tmp.path()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key(), b"a");
}

#[test]
fn bad_magic_skips_segment_but_not_its_successors() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"old", b"1").unwrap();
    wal.rotate().unwrap();
    wal.log_put(b"new", b"2").unwrap();
    drop(wal);

    // Destroy the header magic of the first (older) segment.
    let mut paths: Vec<PathBuf> = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    overwrite_at(&paths[0], SeekFrom::Start(0), &[0x00, 0x00, 0x00, 0x00]);

    let records = replay_all(tmp.path()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key(), b"new");
}

#[test]
fn implausible_length_is_treated_as_corruption() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"a", b"1").unwrap();
    drop(wal);

    // Overwrite key_len (offset: header + op + seq) with a huge value.
    let segment = only_segment(tmp.path());
    overwrite_at(
        &segment,
        SeekFrom::Start((WAL_HEADER_SIZE + 1 + 8) as u64),
        &u32::MAX.to_le_bytes(),
    );

    let records = replay_all(tmp.path()).unwrap();
    assert!(records.is_empty());
}
