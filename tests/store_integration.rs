use std::path::Path;
use std::sync::Arc;

use docstore::{
    CollectingVisitor, ChecksumFlavor, Config, DocumentStore, FileHeaderContext, InlineExecutor,
    NoopTlogSync, StoreError,
};

fn open_store(dir: &Path, config: Config) -> DocumentStore {
    DocumentStore::open(
        dir,
        config,
        Arc::new(InlineExecutor),
        Arc::new(NoopTlogSync),
        None,
        FileHeaderContext::new("docstore-tests"),
        false,
    )
    .unwrap()
}

#[test]
fn basic_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        max_file_size: 1_000_000,
        crc_on_write: ChecksumFlavor::CcittCrc32,
        ..Config::default()
    };
    let store = open_store(dir.path(), config);
    store.write(1, 0, b"alpha").unwrap();
    store.write(2, 1, b"beta").unwrap();
    store.init_flush().unwrap();

    let mut buf = Vec::new();
    assert_eq!(store.read(0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"alpha");
    assert_eq!(store.read(1, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"beta");
    assert_eq!(store.read(99, &mut buf).unwrap(), 0);
}

#[test]
fn overwrite_charges_bloat_to_old_location() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Config::default());
    store.write(1, 0, b"first-version").unwrap();
    store.write(2, 0, b"second-version-longer-payload").unwrap();
    store.init_flush().unwrap();

    let stats = store.storage_stats();
    assert!(
        stats.disk_bloat > 0,
        "overwriting a lid should charge bloat to its old location"
    );

    let mut buf = Vec::new();
    store.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"second-version-longer-payload");
}

#[test]
fn remove_clears_the_lid() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Config::default());
    store.write(1, 0, b"data").unwrap();
    store.remove(2, 0).unwrap();

    let mut buf = Vec::new();
    assert_eq!(store.read(0, &mut buf).unwrap(), 0);
}

#[test]
fn rotation_splits_across_files_under_small_max_file_size() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        max_file_size: 64,
        max_chunk_bytes: 16,
        max_chunk_records: 1,
        ..Config::default()
    };
    let store = open_store(dir.path(), config);
    for lid in 0u32..20 {
        store.write(lid as u64 + 1, lid, &[lid as u8; 10]).unwrap();
    }
    store.init_flush().unwrap();

    let stats = store.storage_stats();
    assert!(
        stats.num_files > 1,
        "writing past max_file_size should rotate to new chunk files"
    );
    assert_eq!(stats.num_live_lids, 20);

    let mut buf = Vec::new();
    for lid in 0u32..20 {
        assert_eq!(store.read(lid, &mut buf).unwrap(), 10);
        assert_eq!(buf, vec![lid as u8; 10]);
    }
}

#[test]
fn compaction_reduces_bloat() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        max_file_size: 64,
        max_disk_bloat_factor: 0.1,
        ..Config::default()
    };
    let store = open_store(dir.path(), config);

    for lid in 0u32..10 {
        store.write(lid as u64 + 1, lid, &[1u8; 10]).unwrap();
    }
    store.init_flush().unwrap();
    for lid in 0u32..10 {
        store.write(100 + lid as u64, lid, &[2u8; 10]).unwrap();
    }
    store.init_flush().unwrap();

    let before = store.storage_stats();
    assert!(before.disk_bloat > 0);

    let mut compacted_any = false;
    for _ in 0..10 {
        if store.compact().unwrap() {
            compacted_any = true;
        } else {
            break;
        }
    }
    assert!(
        compacted_any,
        "a file well above max_disk_bloat_factor should be selected for compaction"
    );

    let mut buf = Vec::new();
    for lid in 0u32..10 {
        store.read(lid, &mut buf).unwrap();
        assert_eq!(buf, vec![2u8; 10]);
    }
}

#[test]
fn reopen_recovers_flushed_writes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path(), Config::default());
        store.write(1, 0, b"durable").unwrap();
        store.init_flush().unwrap();
    }
    let store = open_store(dir.path(), Config::default());
    let mut buf = Vec::new();
    assert_eq!(store.read(0, &mut buf).unwrap(), 7);
    assert_eq!(&buf, b"durable");
}

#[test]
fn accept_visits_every_live_record_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Config::default());
    store.write(1, 0, b"a").unwrap();
    store.write(2, 1, b"b").unwrap();
    store.write(3, 0, b"a2").unwrap();
    store.init_flush().unwrap();

    let mut visitor = CollectingVisitor::new();
    store.accept(&mut visitor, None, false).unwrap();
    visitor.records.sort_by_key(|(lid, _)| *lid);
    assert_eq!(visitor.records.len(), 2);
    assert_eq!(visitor.records[0], (0, b"a2".to_vec()));
    assert_eq!(visitor.records[1], (1, b"b".to_vec()));
}

#[test]
fn truncated_nonzero_tail_requires_allow_truncate() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        max_file_size: 0,
        ..Config::default()
    };
    {
        let store = open_store(dir.path(), config.clone());
        store.write(1, 0, b"hello").unwrap();
        store.init_flush().unwrap();
    }

    // The first (and, with rotation disabled, only) chunk file always gets
    // nameId 1.
    let dat = docstore::chunkfile::dat_path(dir.path(), 1);
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&dat).unwrap();
        // A partial next chunk frame: flavor byte, a length prefix, and a
        // few payload bytes that never got a trailing checksum written.
        f.write_all(&[1u8, 0, 0, 0, 50, 9, 9, 9]).unwrap();
    }

    let err = DocumentStore::open(
        dir.path(),
        config.clone(),
        Arc::new(InlineExecutor),
        Arc::new(NoopTlogSync),
        None,
        FileHeaderContext::new("docstore-tests"),
        false,
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)));

    let mut lenient = config;
    lenient.allow_truncate = true;
    let store = open_store(dir.path(), lenient);
    let mut buf = Vec::new();
    assert_eq!(store.read(0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
}
