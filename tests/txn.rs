//! Transaction, conflict and recovery tests.

use std::fs;
use std::path::{Path, PathBuf};

use burrowdb::{
    CursorMove, DbConfig, DbFlags, EnvConfig, EnvFlags, Environment, ErrorKind, InsertFlags,
    MoveFlags, TxnFlags,
};

fn env_dir() -> tempfile::TempDir {
    let _ = env_logger::builder().is_test(true).try_init();
    tempfile::tempdir().unwrap()
}

fn txn_config() -> EnvConfig {
    EnvConfig { flags: EnvFlags::ENABLE_TRANSACTIONS, ..Default::default() }
}

/// The database file plus its two journal files.
fn engine_files(path: &Path) -> Vec<PathBuf> {
    let name = path.file_name().unwrap().to_string_lossy();
    let dir = path.parent().unwrap();
    vec![
        path.to_path_buf(),
        dir.join(format!("{name}.jrn0")),
        dir.join(format!("{name}.jrn1")),
    ]
}

fn snapshot_files(path: &Path, into: &Path) {
    fs::create_dir_all(into).unwrap();
    for file in engine_files(path) {
        if file.exists() {
            fs::copy(&file, into.join(file.file_name().unwrap())).unwrap();
        }
    }
}

fn restore_files(path: &Path, from: &Path) {
    for file in engine_files(path) {
        let saved = from.join(file.file_name().unwrap());
        if saved.exists() {
            fs::copy(&saved, &file).unwrap();
        } else {
            let _ = fs::remove_file(&file);
        }
    }
}

#[test]
fn test_transactional_durability_across_crash() {
    let dir = env_dir();
    let path = dir.path().join("durable.db");
    let snapshot = dir.path().join("snapshot");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();

        let mut txn = env.begin_txn(TxnFlags::empty()).unwrap();
        for i in 0..100u32 {
            db.insert(Some(&txn), format!("key-{i:03}").as_bytes(), &i.to_le_bytes(),
                InsertFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        // Crash simulation: keep the on-disk state from right after the
        // commit, then let the clean close overwrite it.
        snapshot_files(&path, &snapshot);
        drop(db);
    }
    restore_files(&path, &snapshot);

    // Opening without auto-recovery reports the pending journal.
    let err = Environment::open(&path, txn_config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NeedRecovery);

    let cfg = EnvConfig {
        flags: EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::AUTO_RECOVERY,
        ..Default::default()
    };
    let env = Environment::open(&path, cfg).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    for i in 0..100u32 {
        assert_eq!(db.find(None, format!("key-{i:03}").as_bytes()).unwrap(), i.to_le_bytes());
    }
    db.check_integrity().unwrap();

    // Aborted work leaves no trace.
    let mut txn = env.begin_txn(TxnFlags::empty()).unwrap();
    for i in 100..150u32 {
        db.insert(Some(&txn), format!("key-{i:03}").as_bytes(), &i.to_le_bytes(),
            InsertFlags::empty()).unwrap();
    }
    txn.abort().unwrap();
    assert_eq!(db.count(None, true).unwrap(), 100);
    assert_eq!(
        db.find(None, b"key-120").unwrap_err().kind(),
        ErrorKind::KeyNotFound
    );
}

#[test]
fn test_uncommitted_is_not_recovered() {
    let dir = env_dir();
    let path = dir.path().join("uncommitted.db");
    let snapshot = dir.path().join("snapshot");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();

        let mut committed = env.begin_txn(TxnFlags::empty()).unwrap();
        db.insert(Some(&committed), b"kept", b"v", InsertFlags::empty()).unwrap();
        committed.commit().unwrap();

        // This transaction never commits before the "crash".
        let open_txn = env.begin_txn(TxnFlags::empty()).unwrap();
        db.insert(Some(&open_txn), b"lost", b"v", InsertFlags::empty()).unwrap();
        snapshot_files(&path, &snapshot);
        drop(open_txn);
        drop(db);
    }
    restore_files(&path, &snapshot);

    let cfg = EnvConfig {
        flags: EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::AUTO_RECOVERY,
        ..Default::default()
    };
    let env = Environment::open(&path, cfg).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"kept").unwrap(), b"v");
    assert_eq!(db.find(None, b"lost").unwrap_err().kind(), ErrorKind::KeyNotFound);
}

#[test]
fn test_conflict_between_transactions() {
    let dir = env_dir();
    let path = dir.path().join("conflict.db");
    let env = Environment::create(&path, txn_config()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let mut txn1 = env.begin_txn(TxnFlags::empty()).unwrap();
    db.insert(Some(&txn1), b"k", b"v", InsertFlags::empty()).unwrap();

    // Another transaction (and the non-transactional path) sees a conflict.
    let txn2 = env.begin_txn(TxnFlags::empty()).unwrap();
    assert_eq!(db.find(Some(&txn2), b"k").unwrap_err().kind(), ErrorKind::TxnConflict);
    assert_eq!(db.find(None, b"k").unwrap_err().kind(), ErrorKind::TxnConflict);
    assert_eq!(
        db.insert(Some(&txn2), b"k", b"other", InsertFlags::empty()).unwrap_err().kind(),
        ErrorKind::TxnConflict
    );

    // The owner sees its own write.
    assert_eq!(db.find(Some(&txn1), b"k").unwrap(), b"v");

    txn1.commit().unwrap();
    assert_eq!(db.find(Some(&txn2), b"k").unwrap(), b"v");
}

#[test]
fn test_txn_read_own_writes_and_scan_merge() {
    let dir = env_dir();
    let path = dir.path().join("merge.db");
    let env = Environment::create(&path, txn_config()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    // Committed base state.
    for key in [b"b", b"d", b"f"] {
        db.insert(None, key, b"committed", InsertFlags::empty()).unwrap();
    }

    let mut txn = env.begin_txn(TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"a", b"mine", InsertFlags::empty()).unwrap();
    db.insert(Some(&txn), b"d", b"overwritten", InsertFlags::OVERWRITE).unwrap();
    db.erase(Some(&txn), b"f").unwrap();

    // Reads merge the op-log over the committed tree.
    assert_eq!(db.find(Some(&txn), b"a").unwrap(), b"mine");
    assert_eq!(db.find(Some(&txn), b"b").unwrap(), b"committed");
    assert_eq!(db.find(Some(&txn), b"d").unwrap(), b"overwritten");
    assert_eq!(db.find(Some(&txn), b"f").unwrap_err().kind(), ErrorKind::KeyNotFound);

    // The cursor scan observes the same merged view.
    {
        let cursor = db.cursor(Some(&txn)).unwrap();
        let mut seen = Vec::new();
        let mut next = cursor.move_to(CursorMove::First, MoveFlags::empty()).unwrap();
        while let Some((key, record)) = next {
            seen.push((key, record));
            next = cursor.move_to(CursorMove::Next, MoveFlags::empty()).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"mine".to_vec()),
                (b"b".to_vec(), b"committed".to_vec()),
                (b"d".to_vec(), b"overwritten".to_vec()),
            ]
        );
    }

    // Other observers still see the committed state.
    assert_eq!(db.find(None, b"b").unwrap(), b"committed");
    assert_eq!(db.count(Some(&txn), true).unwrap(), 3);
    assert_eq!(db.count(None, true).unwrap(), 3);

    txn.commit().unwrap();
    assert_eq!(db.find(None, b"d").unwrap(), b"overwritten");
    assert_eq!(db.find(None, b"f").unwrap_err().kind(), ErrorKind::KeyNotFound);
}

#[test]
fn test_scan_skips_foreign_pending_keys() {
    let dir = env_dir();
    let path = dir.path().join("skip.db");
    let env = Environment::create(&path, txn_config()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"a", b"v", InsertFlags::empty()).unwrap();
    db.insert(None, b"c", b"v", InsertFlags::empty()).unwrap();

    // Another transaction claims "b" (new) and "c" (overwrite).
    let mut other = env.begin_txn(TxnFlags::empty()).unwrap();
    db.insert(Some(&other), b"b", b"pending", InsertFlags::empty()).unwrap();
    db.insert(Some(&other), b"c", b"pending", InsertFlags::OVERWRITE).unwrap();

    // A scan silently skips keys owned by the other transaction.
    {
        let cursor = db.cursor(None).unwrap();
        let mut keys = Vec::new();
        let mut next = cursor.move_to(CursorMove::First, MoveFlags::empty()).unwrap();
        while let Some((key, _)) = next {
            keys.push(key);
            next = cursor.move_to(CursorMove::Next, MoveFlags::empty()).unwrap();
        }
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    // Positional lookups surface the conflict instead.
    {
        let cursor = db.cursor(None).unwrap();
        assert_eq!(
            cursor.find(b"c", burrowdb::FindFlags::empty()).unwrap_err().kind(),
            ErrorKind::TxnConflict
        );
    }

    other.abort().unwrap();
    assert_eq!(db.find(None, b"c").unwrap(), b"v");
}

#[test]
fn test_cursor_must_close_before_commit() {
    let dir = env_dir();
    let path = dir.path().join("cursorguard.db");
    let env = Environment::create(&path, txn_config()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let mut txn = env.begin_txn(TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();
    let cursor = db.cursor(Some(&txn)).unwrap();
    assert_eq!(txn.commit().unwrap_err().kind(), ErrorKind::CursorStillOpen);

    drop(cursor);
    txn.commit().unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
}

#[test]
fn test_temporary_transaction_wraps_single_ops() {
    let dir = env_dir();
    let path = dir.path().join("temp.db");
    let snapshot = dir.path().join("snapshot");
    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        // No explicit transaction: the engine wraps each op in a temporary
        // one, so the journal still covers it.
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
        snapshot_files(&path, &snapshot);
        drop(db);
    }
    restore_files(&path, &snapshot);

    let cfg = EnvConfig {
        flags: EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::AUTO_RECOVERY,
        ..Default::default()
    };
    let env = Environment::open(&path, cfg).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
}

#[test]
fn test_flush_immediately_without_recovery() {
    // With recovery disabled there is no journal; immediate flushing is
    // what makes commits durable.
    let dir = env_dir();
    let path = dir.path().join("noflushjournal.db");
    let snapshot = dir.path().join("snapshot");
    let cfg = EnvConfig {
        flags: EnvFlags::ENABLE_TRANSACTIONS
            | EnvFlags::DISABLE_RECOVERY
            | EnvFlags::FLUSH_TRANSACTIONS_IMMEDIATELY,
        ..Default::default()
    };

    {
        let env = Environment::create(&path, cfg.clone()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        let mut txn = env.begin_txn(TxnFlags::empty()).unwrap();
        db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();
        txn.commit().unwrap();
        snapshot_files(&path, &snapshot);
        drop(db);
    }
    restore_files(&path, &snapshot);
    assert!(!path.with_extension("db.jrn0").exists());

    let env = Environment::open(&path, cfg).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
}

#[test]
fn test_recovery_with_journal_compression() {
    let dir = env_dir();
    let path = dir.path().join("jrncomp.db");
    let snapshot = dir.path().join("snapshot");
    let cfg = EnvConfig {
        flags: EnvFlags::ENABLE_TRANSACTIONS,
        journal_compression: burrowdb::Codec::Zlib,
        ..Default::default()
    };

    {
        let env = Environment::create(&path, cfg.clone()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        let record = b"squeeze me ".repeat(100);
        let mut txn = env.begin_txn(TxnFlags::empty()).unwrap();
        db.insert(Some(&txn), b"big", &record, InsertFlags::empty()).unwrap();
        txn.commit().unwrap();
        snapshot_files(&path, &snapshot);
        drop(db);
    }
    restore_files(&path, &snapshot);

    let cfg = EnvConfig {
        flags: EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::AUTO_RECOVERY,
        journal_compression: burrowdb::Codec::Zlib,
        ..Default::default()
    };
    let env = Environment::open(&path, cfg).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"big").unwrap(), b"squeeze me ".repeat(100));
}

#[test]
fn test_read_only_transaction() {
    let dir = env_dir();
    let path = dir.path().join("rotxn.db");
    let env = Environment::create(&path, txn_config()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let txn = env.begin_txn(TxnFlags::READ_ONLY).unwrap();
    assert_eq!(db.find(Some(&txn), b"k").unwrap(), b"v");
    assert_eq!(
        db.insert(Some(&txn), b"x", b"y", InsertFlags::empty()).unwrap_err().kind(),
        ErrorKind::WriteProtected
    );
}
