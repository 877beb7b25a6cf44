//! Mid-backup kill and resume (spec §8 S4): a backup that dies partway
//! through must be resumable from its last sealed checkpoint without
//! re-uploading already-sealed chunks or losing anything after them.

mod common;

use datalog_backup::{backup, restore, BackupOptions, RestoreOptions};

use common::{tuple, FakeSourceDb, FlakySourceDb, RecordingTarget};

#[test]
fn s4_killed_backup_resumes_and_restores_completely() {
    let dir = tempfile::tempdir().unwrap();
    let store = datalog_backup::FsStore::new(dir.path());

    let mut tuples = Vec::new();
    for i in 0..30 {
        tuples.push(tuple(i, i, "user/name"));
    }

    let flaky = FlakySourceDb::new(tuples.clone(), 29, 29, 15);
    let first_attempt = backup(
        &store,
        &flaky,
        BackupOptions { database_id: "db1".into(), backup_id: Some("b1".into()), chunk_bytes: 80, ..Default::default() },
    );
    assert!(first_attempt.is_err(), "the flaky source should have killed the first attempt");

    // Resume with a source that serves the same full dataset; the backup
    // engine filters by the checkpoint's last sealed `t`.
    let healthy = FakeSourceDb::new(tuples, 30);
    let resumed = backup(
        &store,
        &healthy,
        BackupOptions { database_id: "db1".into(), backup_id: Some("b1".into()), chunk_bytes: 80, ..Default::default() },
    )
    .unwrap();
    assert!(resumed.success);

    let target = RecordingTarget::empty();
    let restore_result = restore(
        &store,
        &target,
        RestoreOptions { database_id: "db1".into(), backup_id: "b1".into(), ..Default::default() },
    )
    .unwrap();
    assert_eq!(restore_result.tuples_restored, 30);

    let loaded = target.loaded.lock().unwrap();
    let mut seen_e: Vec<i64> = loaded.iter().map(|t| t.e).collect();
    seen_e.sort();
    seen_e.dedup();
    assert_eq!(seen_e.len(), 30, "no entity should be missing or duplicated across the resumed backup");
}
