//! Tests for the container lifecycle
//!
//! These tests verify:
//! - The state machine's legal and illegal transitions
//! - Create/open/close/rename, including their error cases
//! - Restart re-registers containers as closed with their data and stats
//! - Size limits and the read-only flag
//! - Close refuses to tear down a container with I/O in flight

use std::sync::Arc;

use flashtree::lifecycle::{ContainerMeta, MetaStore, HIDDEN_PREFIX};
use flashtree::store::MemoryStore;
use flashtree::{
    Config, ContainerConfig, ContainerState, Durability, Engine, ErrorKind, FlashError, IndexMode,
    IndexState, IoMode,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config() -> Config {
    Config::builder()
        .node_size(1024)
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

// =============================================================================
// State Machine Tests
// =============================================================================

#[test]
fn test_container_state_transitions() {
    use ContainerState::*;

    let legal = [
        (Uninitialized, Open),
        (Uninitialized, Closed),
        (Closed, Open),
        (Open, Closed),
        (Closed, DeletePending),
        (DeletePending, DeleteOpen),
        (DeleteOpen, DeletePending),
        (DeleteOpen, DeleteClosed),
        (DeleteClosed, Uninitialized),
    ];
    let all = [Uninitialized, Open, Closed, DeletePending, DeleteOpen, DeleteClosed];

    for from in all {
        for to in all {
            assert_eq!(
                from.can_transition_to(to),
                legal.contains(&(from, to)),
                "{} -> {}",
                from,
                to
            );
        }
    }
}

#[test]
fn test_index_state_transitions() {
    use IndexState::*;

    assert!(Init.can_transition_to(Open));
    assert!(Open.can_transition_to(Closing));
    assert!(Closing.can_transition_to(Closed));
    assert!(Closing.can_transition_to(Open));
    assert!(Closed.can_transition_to(Deleting));
    assert!(Deleting.can_transition_to(Unused));

    assert!(!Closed.can_transition_to(Open));
    assert!(!Unused.can_transition_to(Open));
    assert!(!Open.can_transition_to(Closed));
}

#[test]
fn test_user_visible_states() {
    assert!(ContainerState::Open.is_user_visible());
    assert!(ContainerState::Closed.is_user_visible());
    assert!(!ContainerState::DeletePending.is_user_visible());
    assert!(ContainerState::DeleteOpen.is_deleting());
    assert!(!ContainerState::Closed.is_deleting());
}

// =============================================================================
// Create / Open / Close Tests
// =============================================================================

#[test]
fn test_create_starts_open() {
    let (_store, engine) = setup_engine();

    let id = engine
        .create_container("C", &ContainerConfig::default())
        .unwrap();

    let info = engine.container_info("C").unwrap();
    assert_eq!(info.id, id);
    assert_eq!(info.name, "C");
    assert_eq!(info.state, ContainerState::Open);
    assert_eq!(info.index_state, Some(IndexState::Open));
    assert_eq!(info.mode, IndexMode::Ordered);
    assert_eq!(info.objects, 0);
}

#[test]
fn test_create_duplicate_name() {
    let (_store, engine) = setup_engine();
    engine
        .create_container("C", &ContainerConfig::default())
        .unwrap();

    let err = engine
        .create_container("C", &ContainerConfig::default())
        .unwrap_err();

    assert!(matches!(err, FlashError::ContainerExists(name) if name == "C"));
}

#[test]
fn test_create_rejects_bad_names() {
    let (_store, engine) = setup_engine();

    for name in ["", "$deleted.sneaky"] {
        let err = engine
            .create_container(name, &ContainerConfig::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::InvalidArgument(_)), "{:?}", name);
    }
    assert!(engine.list_containers().unwrap().is_empty());
}

#[test]
fn test_close_then_open() {
    let (_store, engine) = setup_engine();
    engine
        .create_container("C", &ContainerConfig::default())
        .unwrap();
    engine.put("C", b"k", b"v").unwrap();

    engine.close_container("C").unwrap();
    let info = engine.container_info("C").unwrap();
    assert_eq!(info.state, ContainerState::Closed);
    assert_eq!(info.index_state, None);
    assert_eq!(info.objects, 1);

    engine.open_container("C").unwrap();
    assert_eq!(engine.get("C", b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_illegal_open_and_close() {
    let (_store, engine) = setup_engine();
    engine
        .create_container("C", &ContainerConfig::default())
        .unwrap();

    let err = engine.open_container("C").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    engine.close_container("C").unwrap();
    let err = engine.close_container("C").unwrap_err();
    assert!(matches!(err, FlashError::InvalidContainerState(_)));
}

#[test]
fn test_close_busy_while_reader_in_flight() {
    let (_store, engine) = setup_engine();
    engine
        .create_container("C", &ContainerConfig::default())
        .unwrap();

    let cref = engine.acquire("C").unwrap();
    let io = cref.begin_io(IoMode::Read).unwrap();

    let err = engine.close_container("C").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(cref.state(), ContainerState::Open);

    drop(io);
    drop(cref);
    engine.close_container("C").unwrap();
}

#[test]
fn test_open_unknown_container() {
    let (_store, engine) = setup_engine();

    assert!(engine.open_container("ghost").unwrap_err().is_not_found());
    assert!(engine.close_container("ghost").unwrap_err().is_not_found());
}

// =============================================================================
// Rename Tests
// =============================================================================

#[test]
fn test_rename() {
    let (store, engine) = setup_engine();
    let id = engine
        .create_container("old", &ContainerConfig::default())
        .unwrap();
    engine.put("old", b"k", b"v").unwrap();

    engine.rename_container("old", "new").unwrap();

    assert!(engine.acquire("old").unwrap_err().is_not_found());
    assert_eq!(engine.container_id("new").unwrap(), id);
    assert_eq!(engine.get("new", b"k").unwrap(), Some(b"v".to_vec()));

    // The new name is what a restart sees
    engine.shutdown().unwrap();
    let engine = reopen(&store);
    assert_eq!(engine.container_id("new").unwrap(), id);
}

#[test]
fn test_rename_errors() {
    let (_store, engine) = setup_engine();
    engine
        .create_container("a", &ContainerConfig::default())
        .unwrap();
    engine
        .create_container("b", &ContainerConfig::default())
        .unwrap();

    assert!(matches!(
        engine.rename_container("a", "b"),
        Err(FlashError::ContainerExists(_))
    ));
    let hidden = format!("{}x", HIDDEN_PREFIX);
    assert!(matches!(
        engine.rename_container("a", &hidden),
        Err(FlashError::InvalidArgument(_))
    ));
    assert!(engine.rename_container("ghost", "c").unwrap_err().is_not_found());
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_restart_registers_closed() {
    let (store, engine) = setup_engine();
    let a = engine
        .create_container("a", &ContainerConfig::default())
        .unwrap();
    let b = engine
        .create_container("b", &ContainerConfig::default())
        .unwrap();
    engine.put("a", b"k1", b"v1").unwrap();
    engine.put("a", b"k2", b"value two").unwrap();
    engine.shutdown().unwrap();

    let engine = reopen(&store);

    assert_eq!(engine.recovery_report().registered, 2);
    let infos = engine.list_containers().unwrap();
    let ids: Vec<_> = infos.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![a, b]);
    assert!(infos.iter().all(|i| i.state == ContainerState::Closed));
    assert_eq!(infos[0].objects, 2);
    assert_eq!(infos[0].live_bytes, (2 + 2) + (2 + 9));

    engine.open_container("a").unwrap();
    assert_eq!(engine.get("a", b"k2").unwrap(), Some(b"value two".to_vec()));
}

#[test]
fn test_stats_survive_restart() {
    let (store, engine) = setup_engine();
    let config = ContainerConfig::builder().mode(IndexMode::Flat).build();
    engine.create_container("F", &config).unwrap();
    engine.put("F", b"a", b"1").unwrap();
    engine.put("F", b"b", b"22").unwrap();
    engine.delete("F", b"a").unwrap();
    engine.shutdown().unwrap();

    let engine = reopen(&store);
    engine.open_container("F").unwrap();

    let info = engine.container_info("F").unwrap();
    assert_eq!(info.mode, IndexMode::Flat);
    assert_eq!(info.objects, 1);
    assert_eq!(info.live_bytes, 3);
}

#[test]
fn test_ids_not_reused_across_restart() {
    let (store, engine) = setup_engine();
    let a = engine
        .create_container("a", &ContainerConfig::default())
        .unwrap();
    engine.shutdown().unwrap();

    let engine = reopen(&store);
    let b = engine
        .create_container("b", &ContainerConfig::default())
        .unwrap();

    assert_ne!(a, b);
}

#[test]
fn test_metadata_record_round_trip() {
    let (_store, engine) = setup_engine();
    let config = ContainerConfig::builder()
        .size_limit(4096)
        .durability(Durability::HardwareCrashSafe)
        .compression(true)
        .build();
    let id = engine.create_container("C", &config).unwrap();

    let meta = engine.lifecycle().meta().load(id).unwrap();

    assert_eq!(meta, ContainerMeta::new(id, "C", &config));
    assert!(!meta.delete_in_progress);
    assert_eq!(
        engine.registry().names().lookup("C").unwrap().meta_key,
        MetaStore::meta_key(id)
    );
}

// =============================================================================
// Limits & Flags Tests
// =============================================================================

#[test]
fn test_size_limit_enforced() {
    let (_store, engine) = setup_engine();
    let config = ContainerConfig::builder().size_limit(100).build();
    engine.create_container("C", &config).unwrap();

    engine.put("C", b"k1", &[0u8; 40]).unwrap();
    engine.put("C", b"k2", &[0u8; 40]).unwrap();
    let err = engine.put("C", b"k3", &[0u8; 40]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    // Replacing a value only counts the difference
    engine.put("C", b"k1", &[1u8; 50]).unwrap();
    engine.delete("C", b"k2").unwrap();
    engine.put("C", b"k3", &[0u8; 40]).unwrap();
}

#[test]
fn test_read_only_persists() {
    let (store, engine) = setup_engine();
    engine
        .create_container("C", &ContainerConfig::default())
        .unwrap();
    engine.put("C", b"k", b"v").unwrap();
    engine.set_read_only("C", true).unwrap();

    assert!(matches!(
        engine.put("C", b"k", b"w"),
        Err(FlashError::ReadOnly(_))
    ));
    engine.shutdown().unwrap();

    let engine = reopen(&store);
    engine.open_container("C").unwrap();
    assert!(engine.container_info("C").unwrap().read_only);
    assert_eq!(engine.delete("C", b"k").unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(engine.get("C", b"k").unwrap(), Some(b"v".to_vec()));

    engine.set_read_only("C", false).unwrap();
    engine.put("C", b"k", b"w").unwrap();
}

#[test]
fn test_read_only_at_create() {
    let (_store, engine) = setup_engine();
    let config = ContainerConfig::builder().read_only(true).build();
    engine.create_container("C", &config).unwrap();

    assert!(matches!(
        engine.put("C", b"k", b"v"),
        Err(FlashError::ReadOnly(_))
    ));
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[test]
fn test_shutdown_closes_everything() {
    let (store, engine) = setup_engine();
    engine
        .create_container("a", &ContainerConfig::default())
        .unwrap();
    engine
        .create_container("b", &ContainerConfig::default())
        .unwrap();
    engine.close_container("b").unwrap();
    let lifecycle = engine.lifecycle().clone();

    engine.shutdown().unwrap();

    assert!(lifecycle
        .registry()
        .registered()
        .iter()
        .all(|(_, state)| *state == ContainerState::Closed));
    assert!(matches!(
        lifecycle.create("c", &ContainerConfig::default()),
        Err(FlashError::ShuttingDown)
    ));
    drop(lifecycle);
    assert_eq!(reopen(&store).list_containers().unwrap().len(), 2);
}
