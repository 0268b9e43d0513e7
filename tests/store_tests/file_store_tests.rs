//! Tests for FileStore
//!
//! These tests verify:
//! - Basic read/write/delete per namespace
//! - Create-mode writes refuse to overwrite
//! - Objects survive reopening the store
//! - Corrupted object files are detected
//! - Temp files from interrupted writes are cleaned up

use std::fs;
use std::path::{Path, PathBuf};

use flashtree::store::{FileStore, ObjectKind, ObjectStore, SyncMode, WriteMode};
use flashtree::{ContainerId, ErrorKind, FlashError};
use tempfile::TempDir;

const CID: ContainerId = ContainerId(3);

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store() -> (TempDir, FileStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    (temp_dir, store)
}

fn put(store: &FileStore, kind: ObjectKind, key: &[u8], data: &[u8]) {
    store
        .write(CID, kind, key, data, WriteMode::Set, SyncMode::None)
        .unwrap();
}

fn object_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(object_files(&path));
        } else {
            files.push(path);
        }
    }
    files.sort();
    files
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_write_read() {
    let (_temp, store) = setup_store();

    put(&store, ObjectKind::Typed, b"key", b"value");

    assert_eq!(&store.read(CID, ObjectKind::Typed, b"key").unwrap()[..], b"value");
}

#[test]
fn test_read_missing() {
    let (_temp, store) = setup_store();

    let err = store.read(CID, ObjectKind::Typed, b"nope").unwrap_err();
    assert!(matches!(err, FlashError::ObjectNotFound));
}

#[test]
fn test_overwrite() {
    let (_temp, store) = setup_store();

    put(&store, ObjectKind::Typed, b"key", b"first");
    put(&store, ObjectKind::Typed, b"key", b"second value");

    assert_eq!(
        &store.read(CID, ObjectKind::Typed, b"key").unwrap()[..],
        b"second value"
    );
}

#[test]
fn test_create_mode_refuses_existing() {
    let (_temp, store) = setup_store();

    store
        .write(CID, ObjectKind::Typed, b"k", b"1", WriteMode::Create, SyncMode::None)
        .unwrap();
    let err = store
        .write(CID, ObjectKind::Typed, b"k", b"2", WriteMode::Create, SyncMode::None)
        .unwrap_err();

    assert!(matches!(err, FlashError::ObjectExists));
    assert_eq!(&store.read(CID, ObjectKind::Typed, b"k").unwrap()[..], b"1");
}

#[test]
fn test_kinds_are_separate_namespaces() {
    let (_temp, store) = setup_store();

    put(&store, ObjectKind::Typed, b"same", b"typed");
    put(&store, ObjectKind::Raw, b"same", b"raw");

    assert_eq!(&store.read(CID, ObjectKind::Typed, b"same").unwrap()[..], b"typed");
    assert_eq!(&store.read(CID, ObjectKind::Raw, b"same").unwrap()[..], b"raw");
}

#[test]
fn test_containers_are_separate_namespaces() {
    let (_temp, store) = setup_store();

    put(&store, ObjectKind::Typed, b"k", b"mine");

    assert!(!store.contains(ContainerId(4), ObjectKind::Typed, b"k").unwrap());
    assert!(store.contains(CID, ObjectKind::Typed, b"k").unwrap());
}

#[test]
fn test_delete() {
    let (_temp, store) = setup_store();
    put(&store, ObjectKind::Raw, b"gone", b"soon");

    store.delete(CID, ObjectKind::Raw, b"gone").unwrap();

    assert!(!store.contains(CID, ObjectKind::Raw, b"gone").unwrap());
    assert!(store
        .delete(CID, ObjectKind::Raw, b"gone")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_keys_sorted_per_kind() {
    let (_temp, store) = setup_store();
    put(&store, ObjectKind::Typed, b"b", b"");
    put(&store, ObjectKind::Typed, &[0x00, 0xFF], b"");
    put(&store, ObjectKind::Typed, b"a", b"");
    put(&store, ObjectKind::Raw, b"z", b"");

    let typed = store.keys(CID, ObjectKind::Typed).unwrap();

    assert_eq!(typed, vec![vec![0x00, 0xFF], b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(store.keys(CID, ObjectKind::Raw).unwrap(), vec![b"z".to_vec()]);
    assert!(store.keys(ContainerId(99), ObjectKind::Typed).unwrap().is_empty());
}

#[test]
fn test_flush() {
    let (_temp, store) = setup_store();
    put(&store, ObjectKind::Typed, b"k", b"v");

    store.flush(CID, ObjectKind::Typed, b"k").unwrap();
    store.flush_container(CID).unwrap();
    assert!(store
        .flush(CID, ObjectKind::Typed, b"missing")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_hardware_sync_write() {
    let (_temp, store) = setup_store();

    store
        .write(CID, ObjectKind::Typed, b"k", b"durable", WriteMode::Set, SyncMode::Hardware)
        .unwrap();

    assert_eq!(&store.read(CID, ObjectKind::Typed, b"k").unwrap()[..], b"durable");
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_objects_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = FileStore::open(temp_dir.path()).unwrap();
        put(&store, ObjectKind::Typed, b"persist", b"me");
        put(&store, ObjectKind::Raw, b"big", &vec![7u8; 100_000]);
    }

    let store = FileStore::open(temp_dir.path()).unwrap();

    assert_eq!(&store.read(CID, ObjectKind::Typed, b"persist").unwrap()[..], b"me");
    assert_eq!(store.read(CID, ObjectKind::Raw, b"big").unwrap().len(), 100_000);
}

#[test]
fn test_corrupted_object_detected() {
    let (temp, store) = setup_store();
    put(&store, ObjectKind::Typed, b"k", b"some payload bytes");

    let files = object_files(temp.path());
    assert_eq!(files.len(), 1);
    let mut bytes = fs::read(&files[0]).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&files[0], bytes).unwrap();

    let err = store.read(CID, ObjectKind::Typed, b"k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_truncated_object_detected() {
    let (temp, store) = setup_store();
    put(&store, ObjectKind::Typed, b"k", b"some payload bytes");

    let files = object_files(temp.path());
    fs::write(&files[0], b"FTOB").unwrap();

    let err = store.read(CID, ObjectKind::Typed, b"k").unwrap_err();
    assert!(matches!(err, FlashError::Corruption(_)));
}

#[test]
fn test_stale_temp_files_removed_on_open() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = FileStore::open(temp_dir.path()).unwrap();
        put(&store, ObjectKind::Typed, b"k", b"v");
    }
    let files = object_files(temp_dir.path());
    let container_dir = files[0].parent().unwrap().to_path_buf();
    let leftover = container_dir.join("t-6b.obj.tmp.17");
    fs::write(&leftover, b"half written").unwrap();

    let store = FileStore::open(temp_dir.path()).unwrap();

    assert!(!leftover.exists());
    assert_eq!(store.keys(CID, ObjectKind::Typed).unwrap(), vec![b"k".to_vec()]);
}
