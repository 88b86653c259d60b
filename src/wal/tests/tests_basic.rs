use tempfile::TempDir;

use super::helpers::{init_tracing, open_wal, replay_all, sync_opts};
use crate::engine::utils::Record;
use crate::wal::{Wal, WalError};

#[test]
fn append_and_replay_roundtrip() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"alpha", b"one").unwrap();
    wal.log_put(b"beta", b"two").unwrap();
    wal.log_delete(b"alpha").unwrap();
    drop(wal);

    let records = replay_all(tmp.path()).unwrap();
    assert_eq!(
        records,
        vec![
            Record::Put {
                key: b"alpha".to_vec(),
                value: b"one".to_vec(),
                seq: 1,
            },
            Record::Put {
                key: b"beta".to_vec(),
                value: b"two".to_vec(),
                seq: 2,
            },
            Record::Delete {
                key: b"alpha".to_vec(),
                seq: 3,
            },
        ]
    );
}

#[test]
fn sequences_are_monotonic_across_record_types() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    let s1 = wal.log_put(b"k", b"v").unwrap();
    let s2 = wal.log_delete(b"k").unwrap();
    let s3 = wal.log_put(b"k", b"v2").unwrap();

    assert_eq!((s1, s2, s3), (1, 2, 3));
    assert_eq!(wal.last_seq(), 3);
}

#[test]
fn empty_value_put_survives_replay_as_put() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"k", b"").unwrap();
    drop(wal);

    let records = replay_all(tmp.path()).unwrap();
    assert_eq!(records.len(), 1);
    match &records[0] {
        Record::Put { value, .. } => assert!(value.is_empty()),
        other => panic!("expected empty-value put, got {other:?}"),
    }
}

#[test]
fn empty_key_is_rejected() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    assert!(matches!(
        wal.log_put(b"", b"v"),
        Err(WalError::InvalidArgument(_))
    ));
    assert!(matches!(
        wal.log_delete(b""),
        Err(WalError::InvalidArgument(_))
    ));
    assert_eq!(wal.last_seq(), 0);
}

#[test]
fn replay_of_missing_directory_is_empty() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let highest = Wal::replay_dir(tmp.path().join("never-created"), |_| {
        panic!("no records expected")
    })
    .unwrap();
    assert_eq!(highest, 0);
}

#[test]
fn replay_continues_after_reopen() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, _cp) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"a", b"1").unwrap();
    drop(wal);

    // Reopen the directory the way the engine does: replay, then continue
    // appending into a fresh segment at highest + 1.
    let highest = Wal::replay_dir(tmp.path(), |_| {}).unwrap();
    assert_eq!(highest, 1);

    let checkpoints = std::sync::Arc::new(crate::checkpoint::CheckpointManager::new());
    let wal = Wal::open(tmp.path(), highest + 1, sync_opts(), checkpoints).unwrap();
    wal.log_put(b"b", b"2").unwrap();
    drop(wal);

    let records = replay_all(tmp.path()).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].seq(), 2);
}

#[test]
fn checkpoint_registers_last_assigned_seq() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let (wal, checkpoints) = open_wal(tmp.path(), sync_opts());
    wal.log_put(b"a", b"1").unwrap();
    wal.log_put(b"b", b"2").unwrap();

    let seq = wal.checkpoint("flush-pending");
    assert_eq!(seq, 2);
    assert_eq!(checkpoints.min_seq(), Some(2));

    wal.remove_checkpoint("flush-pending");
    assert_eq!(checkpoints.min_seq(), None);
}
