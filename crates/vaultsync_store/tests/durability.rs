//! On-disk durability and property tests for the change store.

use proptest::prelude::*;
use std::io::Write;
use tempfile::tempdir;
use vaultsync_protocol::{ChangeRecord, Cursor, OwnerId};
use vaultsync_store::{ChangeStore, StoreConfig, CHANGES_LOG, META_LOG};

fn snapshot(store: &ChangeStore) -> Vec<(u64, ChangeRecord)> {
    store
        .get_all()
        .map(|c| c.map(|c| (c.seq, c.record)))
        .collect::<Result<_, _>>()
        .unwrap()
}

fn record_strategy() -> impl Strategy<Value = ChangeRecord> {
    ("[a-z0-9]{1,12}", ".{0,64}").prop_map(|(id, data)| ChangeRecord::new(id, data))
}

#[test]
fn reopen_restores_records_pending_and_cursor() {
    let dir = tempdir().unwrap();
    let owner = OwnerId::new("alice");

    {
        let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
        store.put_local(&owner, &ChangeRecord::new("c1", "x")).unwrap();
        store.put(&ChangeRecord::new("r1", "remote")).unwrap();
        store.sync().unwrap();
        store.set_cursor(&owner, Cursor::new(3)).unwrap();
    }

    let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.pending_count(&owner), 1);
    assert_eq!(store.cursor(&owner), Cursor::new(3));
    assert!(store.recovery_report().is_clean());
}

#[test]
fn torn_write_on_disk_is_repaired() {
    let dir = tempdir().unwrap();
    {
        let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
        store.put(&ChangeRecord::new("c1", "x")).unwrap();
        store.put(&ChangeRecord::new("c2", "y")).unwrap();
    }

    // Simulate a crash in the middle of a third append.
    let path = dir.path().join(CHANGES_LOG);
    let intact = std::fs::metadata(&path).unwrap().len();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"VSLG\x01\x00\x40\x00\x00\x00partial").unwrap();
    drop(file);

    let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.len(), 2);
    assert!(store.recovery_report().changes.truncated_bytes > 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
}

#[test]
fn garbage_in_meta_log_keeps_earlier_cursor() {
    let dir = tempdir().unwrap();
    let owner = OwnerId::new("alice");
    {
        let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
        store.set_cursor(&owner, Cursor::new(5)).unwrap();
    }

    let path = dir.path().join(META_LOG);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xFF; 32]).unwrap();
    drop(file);

    let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.cursor(&owner), Cursor::new(5));
    let meta = &store.recovery_report().meta;
    assert_eq!((meta.skipped_bytes, meta.truncated_bytes), (32, 0));

    // Frames written after the garbage are found again on the next open.
    store.set_cursor(&owner, Cursor::new(9)).unwrap();
    drop(store);
    let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.cursor(&owner), Cursor::new(9));
}

#[test]
fn mid_log_header_damage_loses_only_that_record() {
    let dir = tempdir().unwrap();
    let owner = OwnerId::new("alice");
    {
        let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
        for id in ["c1", "c2", "c3"] {
            store.put_local(&owner, &ChangeRecord::new(id, "unsent")).unwrap();
        }
    }

    let path = dir.path().join(CHANGES_LOG);
    let mut bytes = std::fs::read(&path).unwrap();
    let frame_len = bytes.len() / 3;
    // Magic of the middle frame.
    bytes[frame_len] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert!(store.has("c1"));
    assert!(!store.has("c2"));
    assert!(store.has("c3"));
    let pending: Vec<String> = store
        .pending(&owner, 10)
        .unwrap()
        .into_iter()
        .map(|r| r.id().to_string())
        .collect();
    assert_eq!(pending, ["c1", "c3"]);

    let report = &store.recovery_report().changes;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.skipped_bytes, frame_len as u64);
    assert_eq!(report.truncated_bytes, 0);
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
}

#[test]
fn unsynced_writes_become_durable_on_sync() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::default().sync_on_write(false);
    {
        let store = ChangeStore::open(dir.path(), config.clone()).unwrap();
        store.put(&ChangeRecord::new("c1", "x")).unwrap();
        store.sync().unwrap();
    }
    let store = ChangeStore::open(dir.path(), config).unwrap();
    assert!(store.has("c1"));
}

#[test]
fn missing_dir_without_create_fails() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::default().create_if_missing(false);
    assert!(ChangeStore::open(dir.path().join("absent"), config).is_err());
}

#[test]
fn concurrent_writers_on_distinct_ids() {
    let store = ChangeStore::in_memory();
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    store
                        .put(&ChangeRecord::new(format!("t{t}-{i}"), "d"))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.len(), 200);
    let seqs: Vec<u64> = store.get_all().map(|c| c.unwrap().seq).collect();
    assert_eq!(seqs, (1..=200).collect::<Vec<_>>());
}

proptest! {
    #[test]
    fn put_twice_equals_put_once(records in prop::collection::vec(record_strategy(), 1..20)) {
        let once = ChangeStore::in_memory();
        let twice = ChangeStore::in_memory();

        for record in &records {
            once.put(record).unwrap();
            twice.put(record).unwrap();
            twice.put(record).unwrap();
        }

        prop_assert_eq!(snapshot(&once), snapshot(&twice));
        prop_assert_eq!(
            once.stats().unwrap().changes_log_bytes,
            twice.stats().unwrap().changes_log_bytes
        );
    }

    #[test]
    fn reopen_preserves_contents(records in prop::collection::vec(record_strategy(), 0..20)) {
        let dir = tempdir().unwrap();
        let before = {
            let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
            for record in &records {
                store.put(record).unwrap();
            }
            snapshot(&store)
        };

        let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
        prop_assert_eq!(snapshot(&store), before);
    }
}
