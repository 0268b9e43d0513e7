//! Container control blocks
//!
//! One block per identifier, allocated once when the registry is built and
//! recycled through the generation counter.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::lifecycle::{ContainerHandle, ContainerState};
use crate::snapshot::SnapshotGate;
use crate::types::{ContainerId, IndexMode};

/// Mutable part of a control block, guarded by the entry lock
#[derive(Default)]
pub(crate) struct SlotData {
    pub name: String,
    pub state: ContainerState,
    pub handle: Option<Arc<ContainerHandle>>,
    pub read_only: bool,
    pub mode: IndexMode,
}

/// Per-identifier control block
///
/// ## Concurrency:
/// - `data`: entry RwLock; write-locked only for state transitions, renames
///   and handle attach/detach
/// - `readers`, `refs`: atomics, bumped without the entry lock
/// - `gate`: writer count + snapshot phase, its own mutex/condvar
/// - `snapshot_lock`: serializes snapshot create/delete on this container
pub struct ControlBlock {
    id: ContainerId,
    generation: AtomicU64,
    pub(crate) data: RwLock<SlotData>,
    pub(crate) readers: AtomicU32,
    pub(crate) refs: AtomicU32,
    pub(crate) gate: SnapshotGate,
    pub(crate) snapshot_lock: Mutex<()>,
}

impl ControlBlock {
    pub(crate) fn new(id: ContainerId) -> Self {
        Self {
            id,
            generation: AtomicU64::new(0),
            data: RwLock::new(SlotData::default()),
            readers: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            gate: SnapshotGate::new(),
            snapshot_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Bumped every time the identifier is recycled
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn state(&self) -> ContainerState {
        self.data.read().state
    }

    pub fn name(&self) -> String {
        self.data.read().name.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.data.read().read_only
    }

    pub fn mode(&self) -> IndexMode {
        self.data.read().mode
    }

    /// Readers currently inside `begin_io`/`end_io`
    pub fn pending_reads(&self) -> u32 {
        self.readers.load(Ordering::SeqCst)
    }

    /// Writers currently inside `begin_io`/`end_io`
    pub fn pending_writes(&self) -> u32 {
        self.gate.writers()
    }

    /// Outstanding `ContainerRef`s
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// A snapshot is draining writers or taking its mark
    pub fn snapshot_in_progress(&self) -> bool {
        self.gate.phase() != crate::snapshot::SnapshotPhase::Idle
    }

    pub(crate) fn handle(&self) -> Option<Arc<ContainerHandle>> {
        self.data.read().handle.clone()
    }
}
