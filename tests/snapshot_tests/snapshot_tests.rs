//! Tests for snapshots
//!
//! These tests verify:
//! - The writer/snapshot gate phases
//! - A snapshot waits for in-flight writers, never for readers
//! - Reads as of a mark see exactly the writes admitted before it
//! - Limits, deletion, pruning and persistence of marks
//! - A snapshot delete that cannot reach the device keeps the mark
//! - Stale-entry scavenging after an interrupted snapshot delete

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use flashtree::index::{RootMeta, RootStatus};
use flashtree::node::NodeAdapter;
use flashtree::snapshot::{SnapshotGate, SnapshotPhase};
use flashtree::store::{MemoryStore, ObjectKind, ObjectStore};
use flashtree::{
    Config, ContainerConfig, Durability, Engine, ErrorKind, FlashError, IndexMode, IoMode,
};

const NODE_SIZE: usize = 1024;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config() -> Config {
    Config::builder()
        .node_size(NODE_SIZE)
        .inline_threshold(128)
        .max_snapshots(4)
        .drain_timeout_ms(300)
        .snapshot_wait_timeout_ms(2_000)
        .sequence_batch_size(100)
        .sequence_sync_interval(10_000)
        .build()
}

fn setup_engine() -> (Arc<MemoryStore>, Engine) {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::open_with_store(test_config(), store.clone()).unwrap();
    (store, engine)
}

fn reopen(store: &Arc<MemoryStore>) -> Engine {
    Engine::open_with_store(test_config(), store.clone()).unwrap()
}

fn setup_container(engine: &Engine, name: &str) {
    engine
        .create_container(name, &ContainerConfig::default())
        .unwrap();
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(2));
    }
}

// =============================================================================
// Gate Tests
// =============================================================================

#[test]
fn test_gate_drain_blocks_new_writers() {
    let gate = SnapshotGate::new();
    assert_eq!(gate.phase(), SnapshotPhase::Idle);

    let guard = gate.begin_drain(Duration::from_millis(50)).unwrap();
    assert_eq!(gate.phase(), SnapshotPhase::Snapshotting);

    let err = gate.enter_writer(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, FlashError::Busy(_)));

    drop(guard);
    assert_eq!(gate.phase(), SnapshotPhase::Idle);
    gate.enter_writer(Duration::from_millis(50)).unwrap();
    assert_eq!(gate.writers(), 1);
    gate.exit_writer();
}

#[test]
fn test_gate_drain_times_out_and_reopens() {
    let gate = SnapshotGate::new();
    gate.enter_writer(Duration::from_millis(10)).unwrap();

    let err = gate.begin_drain(Duration::from_millis(50)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(gate.phase(), SnapshotPhase::Idle);
    assert_eq!(gate.writers(), 1);
    gate.exit_writer();
}

#[test]
fn test_gate_waiting_writer_admitted_after_snapshot() {
    let gate = SnapshotGate::new();
    let guard = gate.begin_drain(Duration::from_millis(50)).unwrap();

    thread::scope(|s| {
        let writer = s.spawn(|| gate.enter_writer(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.writers(), 0);
        drop(guard);
        writer.join().unwrap().unwrap();
    });

    assert_eq!(gate.writers(), 1);
    gate.exit_writer();
}

#[test]
#[should_panic(expected = "writer count underflow")]
fn test_gate_exit_without_enter_is_fatal() {
    let gate = SnapshotGate::new();
    gate.exit_writer();
}

// =============================================================================
// Quiescence Tests
// =============================================================================

#[test]
fn test_snapshot_waits_for_in_flight_writer() {
    let (_store, engine) = setup_engine();
    setup_container(&engine, "C");
    let entered = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let cref = engine.acquire("C").unwrap();
            let io = cref.begin_io(IoMode::Write).unwrap();
            entered.wait();
            thread::sleep(Duration::from_millis(200));
            let seq = engine.sequence().alloc().unwrap();
            cref.handle().unwrap().put(b"slow", b"writer", seq).unwrap();
            drop(io);
        });

        entered.wait();
        let start = Instant::now();
        let snap = engine.create_snapshot("C").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));

        // The writer was admitted before the mark, so it is inside it
        assert_eq!(
            engine.get_as_of("C", b"slow", snap).unwrap(),
            Some(b"writer".to_vec())
        );

        let late = engine.put("C", b"late", b"write").unwrap();
        assert!(late > snap);
        assert_eq!(engine.get_as_of("C", b"late", snap).unwrap(), None);
        assert_eq!(engine.get("C", b"late").unwrap(), Some(b"write".to_vec()));
    });
}

#[test]
fn test_readers_not_blocked_while_draining() {
    let (_store, engine) = setup_engine();
    setup_container(&engine, "C");
    engine.put("C", b"k", b"v").unwrap();
    let id = engine.container_id("C").unwrap();

    thread::scope(|s| {
        let cref = engine.acquire("C").unwrap();
        let io = cref.begin_io(IoMode::Write).unwrap();

        let snapshot = s.spawn(|| engine.create_snapshot("C"));
        wait_for(|| engine.registry().block(id).snapshot_in_progress());

        let start = Instant::now();
        assert_eq!(engine.get("C", b"k").unwrap(), Some(b"v".to_vec()));
        assert!(start.elapsed() < Duration::from_millis(500));

        drop(io);
        let seq = snapshot.join().unwrap().unwrap();
        assert!(seq > 0);
    });

    assert!(!engine.registry().block(id).snapshot_in_progress());
}

#[test]
fn test_snapshot_fails_busy_when_writer_never_finishes() {
    let store = Arc::new(MemoryStore::new());
    let config = Config::builder()
        .node_size(NODE_SIZE)
        .inline_threshold(128)
        .snapshot_wait_timeout_ms(100)
        .build();
    let engine = Engine::open_with_store(config, store).unwrap();
    setup_container(&engine, "C");

    let cref = engine.acquire("C").unwrap();
    let io = cref.begin_io(IoMode::Write).unwrap();
    let err = engine.create_snapshot("C").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    drop(io);

    // Writers are admitted again and no mark was recorded
    engine.put("C", b"k", b"v").unwrap();
    assert!(engine.list_snapshots("C").unwrap().is_empty());
}

// =============================================================================
// Versioned Read Tests
// =============================================================================

#[test]
fn test_reads_as_of_multiple_marks() {
    let (_store, engine) = setup_engine();
    setup_container(&engine, "C");

    engine.put("C", b"k", b"one").unwrap();
    let s1 = engine.create_snapshot("C").unwrap();
    engine.put("C", b"k", b"two").unwrap();
    let s2 = engine.create_snapshot("C").unwrap();
    engine.delete("C", b"k").unwrap();

    assert!(s1 < s2);
    assert_eq!(engine.get_as_of("C", b"k", s1).unwrap(), Some(b"one".to_vec()));
    assert_eq!(engine.get_as_of("C", b"k", s2).unwrap(), Some(b"two".to_vec()));
    assert_eq!(engine.get("C", b"k").unwrap(), None);
}

#[test]
fn test_key_created_after_mark_invisible() {
    let (_store, engine) = setup_engine();
    setup_container(&engine, "C");

    let snap = engine.create_snapshot("C").unwrap();
    engine.put("C", b"new", b"v").unwrap();

    assert_eq!(engine.get_as_of("C", b"new", snap).unwrap(), None);
}

#[test]
fn test_overflow_values_in_snapshot() {
    let (store, engine) = setup_engine();
    setup_container(&engine, "C");
    let id = engine.container_id("C").unwrap();
    let old = vec![1u8; 1_000];
    let new = vec![2u8; 3_000];

    engine.put("C", b"big", &old).unwrap();
    let snap = engine.create_snapshot("C").unwrap();
    engine.put("C", b"big", &new).unwrap();

    assert_eq!(engine.get_as_of("C", b"big", snap).unwrap(), Some(old));
    assert_eq!(engine.get("C", b"big").unwrap(), Some(new.clone()));
    assert_eq!(store.keys(id, ObjectKind::Raw).unwrap().len(), 2);

    // Only the snapshot kept the old overflow node alive
    engine.delete_snapshot("C", snap).unwrap();
    assert_eq!(store.keys(id, ObjectKind::Raw).unwrap().len(), 1);
    assert_eq!(engine.get("C", b"big").unwrap(), Some(new));
}

// =============================================================================
// Snapshot Management Tests
// =============================================================================

#[test]
fn test_too_many_snapshots() {
    let (_store, engine) = setup_engine();
    setup_container(&engine, "C");

    for _ in 0..4 {
        engine.create_snapshot("C").unwrap();
    }
    let err = engine.create_snapshot("C").unwrap_err();

    assert!(matches!(err, FlashError::TooManySnapshots { limit: 4 }));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(engine.list_snapshots("C").unwrap().len(), 4);
}

#[test]
fn test_list_and_delete_snapshots() {
    let (_store, engine) = setup_engine();
    setup_container(&engine, "C");
    engine.put("C", b"k", b"v").unwrap();

    let s1 = engine.create_snapshot("C").unwrap();
    let s2 = engine.create_snapshot("C").unwrap();
    assert_eq!(engine.list_snapshots("C").unwrap(), vec![s1, s2]);

    engine.delete_snapshot("C", s1).unwrap();

    assert_eq!(engine.list_snapshots("C").unwrap(), vec![s2]);
    let err = engine.get_as_of("C", b"k", s1).unwrap_err();
    assert!(matches!(err, FlashError::SnapshotNotFound(seq) if seq == s1));
    assert!(engine.delete_snapshot("C", s1).unwrap_err().is_not_found());
}

#[test]
fn test_delete_snapshot_prunes_versions() {
    let (_store, engine) = setup_engine();
    setup_container(&engine, "C");

    engine.put("C", b"k", b"v1").unwrap();
    let snap = engine.create_snapshot("C").unwrap();
    engine.put("C", b"k", b"v2").unwrap();
    engine.put("C", b"k", b"v3").unwrap();

    let versions = || {
        let cref = engine.acquire("C").unwrap();
        let handle = cref.handle().unwrap();
        let count = handle.index().unwrap().version_count();
        count
    };
    // v1 for the mark, v3 current; v2 is unreachable
    assert_eq!(versions(), 2);

    engine.delete_snapshot("C", snap).unwrap();
    assert_eq!(versions(), 1);
}

#[test]
fn test_failed_snapshot_delete_keeps_mark() {
    let (store, engine) = setup_engine();
    setup_container(&engine, "C");
    let id = engine.container_id("C").unwrap();
    engine.put("C", b"k", b"v1").unwrap();
    let snap = engine.create_snapshot("C").unwrap();
    engine.put("C", b"k", b"v2").unwrap();

    store.fail_writes(id, 1);
    let err = engine.delete_snapshot("C", snap).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(engine.list_snapshots("C").unwrap(), vec![snap]);
    assert_eq!(engine.get_as_of("C", b"k", snap).unwrap(), Some(b"v1".to_vec()));
    let adapter = NodeAdapter::new(store.clone(), id, NODE_SIZE, Durability::Periodic, None);
    let root = RootMeta::load(&adapter).unwrap();
    assert_eq!(root.snapshots, vec![snap]);
    assert!(!root.status.contains(RootStatus::STALE_ENTRIES_PRESENT));

    engine.shutdown().unwrap();
    let engine = reopen(&store);
    engine.open_container("C").unwrap();
    assert_eq!(engine.list_snapshots("C").unwrap(), vec![snap]);
    assert_eq!(engine.get_as_of("C", b"k", snap).unwrap(), Some(b"v1".to_vec()));

    engine.delete_snapshot("C", snap).unwrap();
    assert!(engine.list_snapshots("C").unwrap().is_empty());
}

#[test]
fn test_snapshot_unsupported_on_flat_container() {
    let (_store, engine) = setup_engine();
    let config = ContainerConfig::builder().mode(IndexMode::Flat).build();
    engine.create_container("F", &config).unwrap();

    let err = engine.create_snapshot("F").unwrap_err();

    assert!(matches!(err, FlashError::Unsupported(_)));
}

#[test]
fn test_snapshot_requires_open_container() {
    let (_store, engine) = setup_engine();
    setup_container(&engine, "C");
    engine.close_container("C").unwrap();

    let err = engine.create_snapshot("C").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn test_snapshots_survive_restart() {
    let (store, engine) = setup_engine();
    let config = ContainerConfig::builder()
        .durability(Durability::SoftwareCrashSafe)
        .build();
    engine.create_container("C", &config).unwrap();
    engine.put("C", b"k", b"before").unwrap();
    let snap = engine.create_snapshot("C").unwrap();
    engine.put("C", b"k", b"after").unwrap();
    engine.shutdown().unwrap();

    let engine = reopen(&store);
    engine.open_container("C").unwrap();

    assert_eq!(engine.list_snapshots("C").unwrap(), vec![snap]);
    assert_eq!(engine.get_as_of("C", b"k", snap).unwrap(), Some(b"before".to_vec()));
    assert_eq!(engine.get("C", b"k").unwrap(), Some(b"after".to_vec()));
    // New numbers are above everything handed out before the restart
    assert!(engine.create_snapshot("C").unwrap() > snap);
}

// =============================================================================
// Stale Entry Tests
// =============================================================================

fn mark_stale(store: &Arc<MemoryStore>, engine: &Engine, name: &str) {
    let id = engine.container_id(name).unwrap();
    let adapter = NodeAdapter::new(store.clone(), id, NODE_SIZE, Durability::Periodic, None);
    RootMeta::update_status(&adapter, RootStatus::STALE_ENTRIES_PRESENT, true).unwrap();
}

#[test]
fn test_open_scavenges_stale_entries() {
    let (store, engine) = setup_engine();
    setup_container(&engine, "C");
    engine.put("C", b"k", b"v").unwrap();
    engine.close_container("C").unwrap();
    mark_stale(&store, &engine, "C");

    engine.open_container("C").unwrap();

    let cref = engine.acquire("C").unwrap();
    let status = cref.handle().unwrap().index().unwrap().root_status();
    assert!(!status.contains(RootStatus::STALE_ENTRIES_PRESENT));
    assert_eq!(engine.get("C", b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_recovery_scavenges_stale_entries() {
    let (store, engine) = setup_engine();
    setup_container(&engine, "C");
    let id = engine.container_id("C").unwrap();
    engine.put("C", b"k", b"v").unwrap();
    engine.close_container("C").unwrap();
    mark_stale(&store, &engine, "C");
    engine.shutdown().unwrap();

    let engine = reopen(&store);

    assert_eq!(engine.recovery_report().scavenged, vec![id]);
    let adapter = NodeAdapter::new(store.clone(), id, NODE_SIZE, Durability::Periodic, None);
    let root = RootMeta::load(&adapter).unwrap();
    assert!(!root.status.contains(RootStatus::STALE_ENTRIES_PRESENT));
}
