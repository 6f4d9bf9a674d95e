//! End-to-end engine tests: round trips, corruption detection, encryption,
//! duplicates, schema behavior.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use burrowdb::{
    register_compare, Codec, CursorMove, DbConfig, DbFlags, EnvConfig, EnvFlags, Environment,
    ErrorKind, FindFlags, InsertFlags, KeyType, MoveFlags, RecordType,
};

fn env_dir() -> tempfile::TempDir {
    let _ = env_logger::builder().is_test(true).try_init();
    tempfile::tempdir().unwrap()
}

#[test]
fn test_round_trip_binary_keys() {
    let dir = env_dir();
    let path = dir.path().join("roundtrip.db");

    {
        let env = Environment::create(&path, EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for i in 1..=512u32 {
            let key = i.to_string();
            let record: Vec<u8> = (0..i).map(|j| j as u8).collect();
            db.insert(None, key.as_bytes(), &record, InsertFlags::empty()).unwrap();
        }
        for i in 1..=512u32 {
            let key = i.to_string();
            let record = db.find(None, key.as_bytes()).unwrap();
            assert_eq!(record.len(), i as usize);
            assert!(record.iter().enumerate().all(|(j, &b)| b == j as u8));
        }
        db.check_integrity().unwrap();
    }

    // Reopen and repeat the finds.
    let env = Environment::open(&path, EnvConfig::default()).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    for i in 1..=512u32 {
        let key = i.to_string();
        let record = db.find(None, key.as_bytes()).unwrap();
        assert_eq!(record.len(), i as usize);
        assert!(record.iter().enumerate().all(|(j, &b)| b == j as u8));
    }
    db.check_integrity().unwrap();
}

#[test]
fn test_crc_detects_corruption() {
    let dir = env_dir();
    let path = dir.path().join("crc.db");
    let cfg = EnvConfig { flags: EnvFlags::ENABLE_CRC32, ..Default::default() };

    {
        let env = Environment::create(&path, cfg.clone()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, b"1", b"", InsertFlags::empty()).unwrap();
    }

    // Flip bytes inside the btree root page.
    {
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(16 * 1024 + 200)).unwrap();
        file.write_all(b"xxx").unwrap();
    }

    let env = Environment::open(&path, cfg).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    let err = db.find(None, b"1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityViolated);
}

#[test]
fn test_encryption_round_trip() {
    let dir = env_dir();
    let path = dir.path().join("enc.db");
    let key = *b"1234567890123456";
    let cfg = EnvConfig { encryption_key: Some(key), ..Default::default() };

    {
        let env = Environment::create(&path, cfg.clone()).unwrap();
        let db = env
            .create_db(1, DbConfig { key_type: KeyType::UInt32, ..Default::default() })
            .unwrap();
        for i in 0..512u32 {
            let record: Vec<u8> = (0..i).map(|j| j as u8).collect();
            db.insert(None, &i.to_le_bytes(), &record, InsertFlags::empty()).unwrap();
        }
    }

    // Same key: everything reads back.
    {
        let env = Environment::open(&path, cfg).unwrap();
        let db = env.open_db(1, DbFlags::empty()).unwrap();
        for i in 0..512u32 {
            let record = db.find(None, &i.to_le_bytes()).unwrap();
            assert_eq!(record.len(), i as usize);
        }
    }

    // Wrong key and no key both fail at open.
    let wrong = EnvConfig { encryption_key: Some(*b"6543210987654321"), ..Default::default() };
    assert_eq!(
        Environment::open(&path, wrong).unwrap_err().kind(),
        ErrorKind::InvalidFileHeader
    );
    assert_eq!(
        Environment::open(&path, EnvConfig::default()).unwrap_err().kind(),
        ErrorKind::InvalidFileHeader
    );
}

#[test]
fn test_duplicate_ordering_through_cursor() {
    let dir = env_dir();
    let path = dir.path().join("dupes.db");
    let env = Environment::create(&path, EnvConfig::default()).unwrap();
    let db = env
        .create_db(
            1,
            DbConfig { flags: DbFlags::ENABLE_DUPLICATE_KEYS, ..Default::default() },
        )
        .unwrap();

    for rec in [b"A", b"B", b"C"] {
        db.insert(
            None,
            b"k",
            rec,
            InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_LAST,
        )
        .unwrap();
    }
    db.insert(
        None,
        b"k",
        b"X",
        InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_FIRST,
    )
    .unwrap();

    let cursor = db.cursor(None).unwrap();
    let (_, first) = cursor.find(b"k", FindFlags::empty()).unwrap();
    let mut records = vec![first];
    while let Some((_, record)) =
        cursor.move_to(CursorMove::Next, MoveFlags::ONLY_DUPLICATES).unwrap()
    {
        records.push(record);
    }
    assert_eq!(records, vec![b"X".to_vec(), b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    assert_eq!(cursor.duplicate_count().unwrap(), 4);
}

#[test]
fn test_cursor_scan_matches_sorted_inserts() {
    let dir = env_dir();
    let path = dir.path().join("scan.db");
    let env = Environment::create(&path, EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    // Insert in a scrambled order, erase a slice, then expect the scan to
    // return exactly inserted-minus-erased in comparator order.
    let mut expected = std::collections::BTreeSet::new();
    for i in 0..300u32 {
        let key = format!("{:05}", (i * 7919) % 100_000);
        if expected.insert(key.clone()) {
            db.insert(None, key.as_bytes(), key.as_bytes(), InsertFlags::empty()).unwrap();
        }
    }
    let erased: Vec<String> = expected.iter().take(50).cloned().collect();
    for key in &erased {
        db.erase(None, key.as_bytes()).unwrap();
        expected.remove(key);
    }

    let cursor = db.cursor(None).unwrap();
    let mut seen = Vec::new();
    let mut next = cursor.move_to(CursorMove::First, MoveFlags::empty()).unwrap();
    while let Some((key, record)) = next {
        assert_eq!(key, record);
        seen.push(String::from_utf8(key).unwrap());
        next = cursor.move_to(CursorMove::Next, MoveFlags::empty()).unwrap();
    }
    assert_eq!(seen, expected.into_iter().collect::<Vec<_>>());
    assert_eq!(db.count(None, true).unwrap(), seen.len() as u64);
}

#[test]
fn test_find_approx_near_prefers_lower() {
    let dir = env_dir();
    let path = dir.path().join("near.db");
    let env = Environment::create(&path, EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    for key in [b"b", b"d", b"f"] {
        db.insert(None, key, b"v", InsertFlags::empty()).unwrap();
    }

    let (key, _) = db.find_approx(None, b"e", FindFlags::NEAR).unwrap();
    assert_eq!(key, b"d");
    let (key, _) = db.find_approx(None, b"a", FindFlags::NEAR).unwrap();
    assert_eq!(key, b"b");
    let (key, _) = db.find_approx(None, b"d", FindFlags::NEAR).unwrap();
    assert_eq!(key, b"d");
    let (key, _) = db.find_approx(None, b"c", FindFlags::GT).unwrap();
    assert_eq!(key, b"d");
    let (key, _) = db.find_approx(None, b"g", FindFlags::LT).unwrap();
    assert_eq!(key, b"f");
}

#[test]
fn test_find_into_buffer() {
    let dir = env_dir();
    let path = dir.path().join("buf.db");
    let env = Environment::create(&path, EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"k", b"0123456789", InsertFlags::empty()).unwrap();

    let mut buf = [0u8; 32];
    let len = db.find_into(None, b"k", &mut buf).unwrap();
    assert_eq!(&buf[..len], b"0123456789");

    let mut small = [0u8; 4];
    assert_eq!(
        db.find_into(None, b"k", &mut small).unwrap_err().kind(),
        ErrorKind::LimitsReached
    );
}

#[test]
fn test_record_number_database() {
    let dir = env_dir();
    let path = dir.path().join("recno.db");
    {
        let env = Environment::create(&path, EnvConfig::default()).unwrap();
        let db = env
            .create_db(1, DbConfig { flags: DbFlags::RECORD_NUMBER64, ..Default::default() })
            .unwrap();
        assert_eq!(db.insert_recno(None, b"first").unwrap(), 1);
        assert_eq!(db.insert_recno(None, b"second").unwrap(), 2);
        assert_eq!(db.insert_recno(None, b"third").unwrap(), 3);
        assert_eq!(db.find(None, &2u64.to_le_bytes()).unwrap(), b"second");
    }

    // The counter is persisted with the database.
    let env = Environment::open(&path, EnvConfig::default()).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.insert_recno(None, b"fourth").unwrap(), 4);
}

#[test]
fn test_in_memory_environment() {
    let dir = env_dir();
    let cfg = EnvConfig { flags: EnvFlags::IN_MEMORY, ..Default::default() };
    let env = Environment::create(&dir.path().join("ignored"), cfg).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    for i in 0..200u32 {
        db.insert(None, format!("k{i}").as_bytes(), &i.to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }
    assert_eq!(db.find(None, b"k123").unwrap(), 123u32.to_le_bytes());
    assert_eq!(db.count(None, true).unwrap(), 200);
    db.check_integrity().unwrap();
}

#[test]
fn test_read_only_environment() {
    let dir = env_dir();
    let path = dir.path().join("ro.db");
    {
        let env = Environment::create(&path, EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
    }

    let cfg = EnvConfig { flags: EnvFlags::READ_ONLY, ..Default::default() };
    let env = Environment::open(&path, cfg).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
    assert_eq!(
        db.insert(None, b"x", b"y", InsertFlags::empty()).unwrap_err().kind(),
        ErrorKind::WriteProtected
    );
}

#[test]
fn test_custom_comparator() {
    fn reversed(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        b.cmp(a)
    }

    let dir = env_dir();
    let path = dir.path().join("custom.db");
    register_compare("engine-test-reversed", reversed);
    {
        let env = Environment::create(&path, EnvConfig::default()).unwrap();
        let db = env
            .create_db(
                1,
                DbConfig {
                    key_type: KeyType::Custom,
                    compare_name: Some("engine-test-reversed".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        for key in [b"a", b"m", b"z"] {
            db.insert(None, key, b"v", InsertFlags::empty()).unwrap();
        }
        let cursor = db.cursor(None).unwrap();
        let (first, _) = cursor.move_to(CursorMove::First, MoveFlags::empty()).unwrap().unwrap();
        assert_eq!(first, b"z", "reversed comparator sorts z first");
    }

    // Reopening resolves the comparator through the registry again; an
    // unregistered name would fail with not-ready.
    let env = Environment::open(&path, EnvConfig::default()).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"m").unwrap(), b"v");
}

#[test]
fn test_database_directory_operations() {
    let dir = env_dir();
    let path = dir.path().join("dir.db");
    let env = Environment::create(&path, EnvConfig::default()).unwrap();
    {
        let db1 = env.create_db(1, DbConfig::default()).unwrap();
        db1.insert(None, b"k", b"v1", InsertFlags::empty()).unwrap();
        let db2 = env.create_db(2, DbConfig::default()).unwrap();
        db2.insert(None, b"k", b"v2", InsertFlags::empty()).unwrap();
    }
    assert_eq!(env.database_names().unwrap(), vec![1, 2]);

    env.rename_db(2, 7).unwrap();
    assert_eq!(
        env.open_db(2, DbFlags::empty()).unwrap_err().kind(),
        ErrorKind::DatabaseNotFound
    );
    {
        let db = env.open_db(7, DbFlags::empty()).unwrap();
        assert_eq!(db.find(None, b"k").unwrap(), b"v2");
    }

    env.erase_db(1).unwrap();
    assert_eq!(env.database_names().unwrap(), vec![7]);
    assert_eq!(
        env.open_db(1, DbFlags::empty()).unwrap_err().kind(),
        ErrorKind::DatabaseNotFound
    );

    assert_eq!(
        env.create_db(7, DbConfig::default()).unwrap_err().kind(),
        ErrorKind::DatabaseAlreadyExists
    );
}

#[test]
fn test_file_size_limit() {
    let dir = env_dir();
    let path = dir.path().join("limit.db");
    let cfg = EnvConfig {
        page_size: 1024,
        file_size_limit: 16 * 1024,
        ..Default::default()
    };
    let env = Environment::create(&path, cfg).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let mut hit_limit = false;
    for i in 0..10_000u32 {
        let record = vec![7u8; 500];
        match db.insert(None, format!("key-{i:06}").as_bytes(), &record, InsertFlags::empty()) {
            Ok(()) => {}
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::LimitsReached);
                hit_limit = true;
                break;
            }
        }
    }
    assert!(hit_limit, "the 16 KiB limit must stop the insert loop");
}

#[test]
fn test_record_compression_round_trip() {
    let dir = env_dir();
    let path = dir.path().join("reccomp.db");
    let cfg = EnvConfig { record_compression: Codec::Zlib, ..Default::default() };
    {
        let env = Environment::create(&path, cfg.clone()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        let record = b"compressible ".repeat(200);
        db.insert(None, b"big", &record, InsertFlags::empty()).unwrap();
        assert_eq!(db.find(None, b"big").unwrap(), record);
    }
    let env = Environment::open(&path, cfg).unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"big").unwrap(), b"compressible ".repeat(200));
}

#[test]
fn test_fixed_record_schema_enforced() {
    let dir = env_dir();
    let path = dir.path().join("fixed.db");
    let env = Environment::create(&path, EnvConfig::default()).unwrap();
    let db = env
        .create_db(
            1,
            DbConfig {
                key_type: KeyType::UInt32,
                record_type: RecordType::UInt64,
                ..Default::default()
            },
        )
        .unwrap();

    db.insert(None, &1u32.to_le_bytes(), &10u64.to_le_bytes(), InsertFlags::empty()).unwrap();
    assert_eq!(
        db.insert(None, &2u32.to_le_bytes(), b"short", InsertFlags::empty()).unwrap_err().kind(),
        ErrorKind::InvalidRecordSize
    );
    assert_eq!(
        db.insert(None, b"bad", &10u64.to_le_bytes(), InsertFlags::empty()).unwrap_err().kind(),
        ErrorKind::InvalidKeySize
    );

    let params = db.parameters().unwrap();
    assert!(params.max_keys_per_page >= 4);
}

#[test]
fn test_open_missing_file() {
    let dir = env_dir();
    let path = dir.path().join("nope.db");
    assert_eq!(
        Environment::open(&path, EnvConfig::default()).unwrap_err().kind(),
        ErrorKind::FileNotFound
    );
}

#[test]
fn test_open_garbage_file() {
    let dir = env_dir();
    let path = dir.path().join("garbage.db");
    std::fs::write(&path, vec![0x5a; 4096]).unwrap();
    assert_eq!(
        Environment::open(&path, EnvConfig::default()).unwrap_err().kind(),
        ErrorKind::InvalidFileHeader
    );
}
