//! Tests for SequenceAllocator
//!
//! These tests verify:
//! - Numbers are strictly increasing, including under contention
//! - The ceiling is advanced (durably) only when the cursor gets close
//! - Restarts resume past the persisted ceiling
//! - Reservation blocks handed to calling contexts

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use flashtree::sequence::SequenceAllocator;
use flashtree::store::{MemoryStore, ObjectStore, SyncMode};
use flashtree::FlashError;

const BATCH: u64 = 10;
const INTERVAL: u64 = 100;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_allocator() -> (Arc<MemoryStore>, SequenceAllocator) {
    let store = Arc::new(MemoryStore::new());
    let alloc = SequenceAllocator::open(store.clone(), BATCH, INTERVAL).unwrap();
    (store, alloc)
}

fn reopen(store: &Arc<MemoryStore>) -> SequenceAllocator {
    let store: Arc<dyn ObjectStore> = store.clone();
    SequenceAllocator::open(store, BATCH, INTERVAL).unwrap()
}

// =============================================================================
// Basic Allocation Tests
// =============================================================================

#[test]
fn test_fresh_allocator_starts_above_zero() {
    let (_store, alloc) = setup_allocator();

    assert_eq!(alloc.alloc().unwrap(), 1);
    assert_eq!(alloc.alloc().unwrap(), 2);
}

#[test]
fn test_alloc_strictly_increasing() {
    let (_store, alloc) = setup_allocator();

    let mut last = 0;
    for _ in 0..1_000 {
        let seq = alloc.alloc().unwrap();
        assert!(seq > last);
        last = seq;
    }
}

#[test]
fn test_concurrent_alloc_unique() {
    let (_store, alloc) = setup_allocator();
    let alloc = Arc::new(alloc);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let alloc = alloc.clone();
            thread::spawn(move || {
                let mut mine = Vec::with_capacity(500);
                let mut last = 0;
                for _ in 0..500 {
                    let seq = alloc.alloc().unwrap();
                    assert!(seq > last);
                    last = seq;
                    mine.push(seq);
                }
                mine
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        for seq in handle.join().unwrap() {
            assert!(all.insert(seq), "duplicate sequence number {}", seq);
        }
    }
    assert_eq!(all.len(), 8 * 500);
}

#[test]
fn test_grant_range() {
    let (_store, alloc) = setup_allocator();

    let range = alloc.grant(5).unwrap();

    assert_eq!(range, 1..6);
    assert_eq!(alloc.cursor(), 6);
}

#[test]
fn test_grant_rejects_bad_counts() {
    let (_store, alloc) = setup_allocator();

    assert!(matches!(alloc.grant(0), Err(FlashError::InvalidArgument(_))));
    assert!(matches!(alloc.grant(INTERVAL + 1), Err(FlashError::InvalidArgument(_))));
}

#[test]
fn test_invalid_settings_rejected() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());

    assert!(matches!(
        SequenceAllocator::open(store.clone(), 0, INTERVAL),
        Err(FlashError::Config(_))
    ));
    assert!(matches!(
        SequenceAllocator::open(store, 50, 10),
        Err(FlashError::Config(_))
    ));
}

// =============================================================================
// Ceiling Tests
// =============================================================================

#[test]
fn test_ceiling_advances_only_near_cursor() {
    let (store, alloc) = setup_allocator();

    // First allocation pushes the ceiling to 1 + INTERVAL
    alloc.alloc().unwrap();
    assert_eq!(alloc.persisted_ceiling(), 1 + INTERVAL);
    assert_eq!(store.sync_count(SyncMode::Hardware), 1);

    // Up to 90 the cursor stays more than a block away from 101
    for _ in 2..=90 {
        alloc.alloc().unwrap();
    }
    assert_eq!(store.sync_count(SyncMode::Hardware), 1);

    // 91 + 1 + BATCH crosses it
    assert_eq!(alloc.alloc().unwrap(), 91);
    assert_eq!(store.sync_count(SyncMode::Hardware), 2);
    assert_eq!(alloc.persisted_ceiling(), 1 + 2 * INTERVAL);
}

#[test]
fn test_granted_numbers_never_exceed_persisted_ceiling() {
    let (_store, alloc) = setup_allocator();

    for _ in 0..1_000 {
        let seq = alloc.alloc().unwrap();
        assert!(seq <= alloc.persisted_ceiling());
    }
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_restart_resumes_past_ceiling() {
    let (store, alloc) = setup_allocator();
    for _ in 0..5 {
        alloc.alloc().unwrap();
    }
    let ceiling = alloc.persisted_ceiling();
    drop(alloc);

    let alloc = reopen(&store);

    assert_eq!(alloc.cursor(), ceiling + 1);
    assert_eq!(alloc.alloc().unwrap(), ceiling + 1);
}

#[test]
fn test_never_regresses_across_crashes() {
    let store = Arc::new(MemoryStore::new());
    let mut last = 0;

    for round in 0..5 {
        let alloc = reopen(&store);
        // Vary how far each incarnation gets before "crashing"
        for _ in 0..(round * 37 + 1) {
            let seq = alloc.alloc().unwrap();
            assert!(seq > last, "round {}: {} <= {}", round, seq, last);
            last = seq;
        }
    }
}

#[test]
fn test_restart_without_allocations_keeps_ceiling() {
    let store = Arc::new(MemoryStore::new());
    let first = reopen(&store);
    assert_eq!(first.persisted_ceiling(), 0);
    drop(first);

    let second = reopen(&store);
    assert_eq!(second.cursor(), 1);
}

// =============================================================================
// Context Tests
// =============================================================================

#[test]
fn test_context_draws_blocks() {
    let (_store, alloc) = setup_allocator();
    let mut ctx = alloc.context();
    assert_eq!(ctx.remaining(), 0);

    let first = ctx.alloc().unwrap();
    assert_eq!(ctx.remaining(), BATCH - 1);
    for i in 1..BATCH {
        assert_eq!(ctx.alloc().unwrap(), first + i);
    }
    assert_eq!(ctx.remaining(), 0);

    // Exhausted: the next block starts where the global cursor is
    assert_eq!(alloc.cursor(), first + BATCH);
    let next = ctx.alloc().unwrap();
    assert_eq!(next, first + BATCH);
}

#[test]
fn test_contexts_hold_disjoint_blocks() {
    let (_store, alloc) = setup_allocator();
    let mut a = alloc.context();
    let mut b = alloc.context();

    let mut seen = HashSet::new();
    for _ in 0..25 {
        assert!(seen.insert(a.alloc().unwrap()));
        assert!(seen.insert(b.alloc().unwrap()));
    }
}
