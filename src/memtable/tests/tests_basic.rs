use crate::engine::utils::Record;
use crate::memtable::{MemTable, MemTableGet};

#[test]
fn put_then_get() {
    let table = MemTable::new(1024);
    table.put(b"k1".to_vec(), b"v1".to_vec(), 1);
    assert_eq!(table.get(b"k1"), MemTableGet::Present(b"v1".to_vec()));
    assert_eq!(table.get(b"k2"), MemTableGet::Absent);
}

#[test]
fn overwrite_keeps_latest_value() {
    let table = MemTable::new(1024);
    table.put(b"k".to_vec(), b"old".to_vec(), 1);
    table.put(b"k".to_vec(), b"new".to_vec(), 2);
    assert_eq!(table.get(b"k"), MemTableGet::Present(b"new".to_vec()));
    assert_eq!(table.len(), 1);
    assert_eq!(table.highest_seq(), 2);
}

#[test]
fn delete_shadows_put() {
    let table = MemTable::new(1024);
    table.put(b"k".to_vec(), b"v".to_vec(), 1);
    table.delete(b"k".to_vec(), 2);
    assert_eq!(table.get(b"k"), MemTableGet::Tombstone);

    // Deleted keys stay in the map as tombstones.
    assert_eq!(table.len(), 1);
}

#[test]
fn delete_of_unknown_key_records_a_tombstone() {
    let table = MemTable::new(1024);
    table.delete(b"ghost".to_vec(), 1);
    assert_eq!(table.get(b"ghost"), MemTableGet::Tombstone);
}

#[test]
fn empty_value_is_present_not_tombstone() {
    let table = MemTable::new(1024);
    table.put(b"k".to_vec(), Vec::new(), 1);
    assert_eq!(table.get(b"k"), MemTableGet::Present(Vec::new()));
}

#[test]
fn iter_sorted_yields_byte_order_with_length_tiebreak() {
    let table = MemTable::new(1024);
    table.put(b"abc".to_vec(), b"3".to_vec(), 1);
    table.put(b"ab".to_vec(), b"2".to_vec(), 2);
    table.delete(b"b".to_vec(), 3);
    table.put(b"a".to_vec(), b"1".to_vec(), 4);

    let keys: Vec<Vec<u8>> = table.iter_sorted().map(|r| r.key().to_vec()).collect();
    assert_eq!(
        keys,
        vec![b"a".to_vec(), b"ab".to_vec(), b"abc".to_vec(), b"b".to_vec()]
    );
}

#[test]
fn iter_sorted_carries_tombstones_and_seqs() {
    let table = MemTable::new(1024);
    table.put(b"keep".to_vec(), b"v".to_vec(), 5);
    table.delete(b"gone".to_vec(), 6);

    let records: Vec<Record> = table.iter_sorted().collect();
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0],
        Record::Delete {
            key: b"gone".to_vec(),
            seq: 6
        }
    );
    assert_eq!(
        records[1],
        Record::Put {
            key: b"keep".to_vec(),
            value: b"v".to_vec(),
            seq: 5
        }
    );
}

#[test]
fn apply_replays_wal_records() {
    let table = MemTable::new(1024);
    table.apply(Record::Put {
        key: b"a".to_vec(),
        value: b"1".to_vec(),
        seq: 10,
    });
    table.apply(Record::Delete {
        key: b"a".to_vec(),
        seq: 11,
    });

    assert_eq!(table.get(b"a"), MemTableGet::Tombstone);
    assert_eq!(table.highest_seq(), 11);
}
