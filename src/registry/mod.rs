//! Registry Module
//!
//! Tracks every registered container: a fixed array of control blocks
//! indexed by identifier, plus a name directory.
//!
//! ## Responsibilities
//! - Hand out and recycle container identifiers
//! - Counted references (`acquire`/`release`) that keep a block alive
//! - I/O admission (`begin_io`/`end_io`) against state, read-only flag,
//!   shutdown and snapshots
//! - Checked state transitions
//!
//! ## Locking
//! ```text
//!   op_lock (container-operation section: create/open/close/delete/rename)
//!      │
//!      ├── names (directory RwLock)
//!      └── slot.data (per-block RwLock)  ──►  slot.gate (writer/snapshot mutex)
//! ```

mod control;
mod directory;
mod guard;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{FlashError, Result};
use crate::lifecycle::{ContainerHandle, ContainerState, MetaStore};
use crate::types::{ContainerId, IndexMode};

pub use control::ControlBlock;
pub(crate) use control::SlotData;
pub use directory::{DirectoryEntry, NameDirectory};
pub use guard::{ContainerRef, IoGuard, IoMode};

/// How to find a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerLookup {
    Id(ContainerId),
    Name(String),
}

impl From<ContainerId> for ContainerLookup {
    fn from(id: ContainerId) -> Self {
        ContainerLookup::Id(id)
    }
}

impl From<&str> for ContainerLookup {
    fn from(name: &str) -> Self {
        ContainerLookup::Name(name.to_string())
    }
}

impl From<String> for ContainerLookup {
    fn from(name: String) -> Self {
        ContainerLookup::Name(name)
    }
}

/// Registration details for a new control block
pub(crate) struct Registration {
    pub id: ContainerId,
    pub name: String,
    pub state: ContainerState,
    pub mode: IndexMode,
    pub read_only: bool,
    pub handle: Option<Arc<ContainerHandle>>,
}

/// The container registry
///
/// ## Concurrency:
/// - `slots`: never resized; each block has its own locks
/// - `names`: RwLock map, mutated only under `op_lock`
/// - `free`: identifiers not bound to any container
/// - `open_handles`, `shutdown`: atomics
pub struct Registry {
    slots: Vec<ControlBlock>,
    names: NameDirectory,
    free: Mutex<BTreeSet<u32>>,
    op_lock: Mutex<()>,
    pub(crate) open_handles: AtomicUsize,
    shutdown: AtomicBool,
    drain_timeout: Duration,
    snapshot_wait: Duration,
}

impl Registry {
    /// Build a registry with `capacity` slots; ids below
    /// `ContainerId::FIRST_USER` are never handed out
    pub fn new(capacity: usize, drain_timeout: Duration, snapshot_wait: Duration) -> Self {
        let capacity = capacity.min(ContainerId::MAX_CAPACITY);
        let slots = (0..capacity as u32)
            .map(|i| ControlBlock::new(ContainerId(i)))
            .collect();
        let free = (ContainerId::FIRST_USER..capacity as u32).collect();

        Self {
            slots,
            names: NameDirectory::new(),
            free: Mutex::new(free),
            op_lock: Mutex::new(()),
            open_handles: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            drain_timeout,
            snapshot_wait,
        }
    }

    /// Enter the container-operation critical section
    pub fn container_op(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Control block for an identifier
    ///
    /// Panics on an identifier outside the registry; callers obtain ids from
    /// the registry itself.
    pub fn block(&self, id: ContainerId) -> &ControlBlock {
        &self.slots[id.index()]
    }

    fn slot(&self, id: ContainerId) -> Result<&ControlBlock> {
        self.slots
            .get(id.index())
            .filter(|_| !id.is_reserved())
            .ok_or_else(|| FlashError::ContainerNotFound(id.to_string()))
    }

    pub fn names(&self) -> &NameDirectory {
        &self.names
    }

    // =========================================================================
    // Identifier Pool
    // =========================================================================

    /// Take the lowest free identifier
    pub fn allocate_id(&self) -> Result<ContainerId> {
        let mut free = self.free.lock();
        let id = free
            .pop_first()
            .ok_or_else(|| FlashError::exhausted(format!("all {} container ids in use", self.slots.len())))?;
        Ok(ContainerId(id))
    }

    /// Remove a specific identifier from the pool (recovery)
    pub fn claim_id(&self, id: ContainerId) -> Result<()> {
        if self.free.lock().remove(&id.as_u32()) {
            Ok(())
        } else {
            Err(FlashError::InvalidContainerState(format!(
                "container id {} is not free",
                id
            )))
        }
    }

    /// Put an identifier back without registering it (failed create)
    pub(crate) fn return_id(&self, id: ContainerId) {
        self.free.lock().insert(id.as_u32());
    }

    pub fn free_ids(&self) -> usize {
        self.free.lock().len()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Bind a claimed identifier to a container. Caller holds `container_op`.
    pub(crate) fn register(&self, reg: Registration) -> Result<()> {
        let block = self.slot(reg.id)?;
        let mut data = block.data.write();
        Self::check_transition(reg.id, data.state, reg.state)?;

        self.names.insert(
            &reg.name,
            DirectoryEntry {
                id: reg.id,
                meta_key: MetaStore::meta_key(reg.id),
            },
        )?;

        *data = SlotData {
            name: reg.name,
            state: reg.state,
            handle: reg.handle,
            read_only: reg.read_only,
            mode: reg.mode,
        };
        tracing::debug!(container = %reg.id, name = %data.name, state = %data.state, "registered container");
        Ok(())
    }

    /// Unbind an identifier and return it to the pool
    ///
    /// The slot must be `DeleteClosed`. Waits (bounded) for outstanding
    /// references, then bumps the generation so stale refs are rejected.
    /// Caller holds `container_op`.
    pub(crate) fn release_id(&self, id: ContainerId) -> Result<()> {
        let block = self.slot(id)?;
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.wait_until(remaining, || block.ref_count() == 0)
                .map_err(|_| FlashError::Busy(format!("container {} still referenced", id)))?;

            let mut data = block.data.write();
            // acquire counts under the read lock: no new ref can appear
            // while this is held, but one may have slipped in before it
            if block.ref_count() != 0 {
                continue;
            }
            Self::check_transition(id, data.state, ContainerState::Uninitialized)?;
            self.names.remove(&data.name);
            *data = SlotData::default();
            block.bump_generation();
            break;
        }
        self.free.lock().insert(id.as_u32());
        tracing::debug!(container = %id, "released container id");
        Ok(())
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    /// Take a counted reference to an open or closed container
    ///
    /// Containers being deleted are reported as not found.
    pub fn acquire(&self, lookup: impl Into<ContainerLookup>) -> Result<ContainerRef<'_>> {
        let id = self.resolve(&lookup.into())?;
        self.acquire_where(id, ContainerState::is_user_visible)
    }

    /// Take a reference regardless of lifecycle state, except unbound slots
    pub(crate) fn acquire_internal(&self, id: ContainerId) -> Result<ContainerRef<'_>> {
        self.acquire_where(id, |state| state != ContainerState::Uninitialized)
    }

    fn acquire_where(
        &self,
        id: ContainerId,
        accept: impl Fn(ContainerState) -> bool,
    ) -> Result<ContainerRef<'_>> {
        let block = self.slot(id)?;
        // Holding the entry lock keeps the state stable while the count rises
        let data = block.data.read();
        if !accept(data.state) {
            return Err(FlashError::ContainerNotFound(id.to_string()));
        }
        block.refs.fetch_add(1, Ordering::SeqCst);
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerRef {
            registry: self,
            id,
            generation: block.generation(),
        })
    }

    /// Give a reference back (same as dropping it)
    pub fn release(&self, cref: ContainerRef<'_>) {
        cref.release()
    }

    /// Map a lookup onto an identifier
    pub fn resolve(&self, lookup: &ContainerLookup) -> Result<ContainerId> {
        match lookup {
            ContainerLookup::Id(id) => {
                self.slot(*id)?;
                Ok(*id)
            }
            ContainerLookup::Name(name) => self
                .names
                .lookup(name)
                .map(|entry| entry.id)
                .ok_or_else(|| FlashError::ContainerNotFound(name.clone())),
        }
    }

    /// References outstanding across all containers
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    // =========================================================================
    // I/O Admission
    // =========================================================================

    /// Admit a reader or writer
    ///
    /// Fails when the container is not `Open`, on writes to a read-only
    /// container, and during shutdown. Writers wait (bounded) while a
    /// snapshot is in progress; readers never wait.
    pub fn begin_io<'a>(&'a self, cref: &ContainerRef<'a>, mode: IoMode) -> Result<IoGuard<'a>> {
        if self.is_shutting_down() {
            return Err(FlashError::ShuttingDown);
        }
        let block = self.block(cref.id);

        match mode {
            IoMode::Read => {
                // Count first, then check: a concurrent close either sees
                // this reader in its drain or this reader sees the close
                block.readers.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.check_io(cref, mode) {
                    block.readers.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
            IoMode::Write => {
                self.check_io(cref, mode)?;
                block.gate.enter_writer(self.snapshot_wait)?;
                if let Err(e) = self.check_io(cref, mode) {
                    block.gate.exit_writer();
                    return Err(e);
                }
            }
        }

        Ok(IoGuard { block, mode })
    }

    /// Explicit `end_io`; dropping the guard does the same
    pub fn end_io(&self, guard: IoGuard<'_>) {
        drop(guard)
    }

    fn check_io(&self, cref: &ContainerRef<'_>, mode: IoMode) -> Result<()> {
        let block = self.block(cref.id);
        let data = block.data.read();
        if block.generation() != cref.generation {
            return Err(FlashError::ContainerNotFound(cref.id.to_string()));
        }
        if data.state != ContainerState::Open {
            return Err(FlashError::InvalidContainerState(format!(
                "container {} is {}, not open",
                cref.id, data.state
            )));
        }
        if mode == IoMode::Write && data.read_only {
            return Err(FlashError::ReadOnly(cref.id));
        }
        if self.is_shutting_down() {
            return Err(FlashError::ShuttingDown);
        }
        Ok(())
    }

    /// Wait (bounded) until no reader or writer is inside the container
    pub fn wait_drained(&self, id: ContainerId) -> Result<()> {
        let block = self.block(id);
        self.wait_until(self.drain_timeout, || {
            block.pending_reads() == 0 && block.pending_writes() == 0
        })
        .map_err(|_| {
            FlashError::Busy(format!(
                "container {} has {} readers and {} writers in flight",
                id,
                block.pending_reads(),
                block.pending_writes()
            ))
        })
    }

    /// Spin, then yield, then sleep until `done` or the timeout passes
    fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> std::result::Result<(), ()> {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        while !done() {
            if Instant::now() >= deadline {
                return Err(());
            }
            if spins < 64 {
                std::hint::spin_loop();
            } else if spins < 128 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
            spins = spins.saturating_add(1);
        }
        Ok(())
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    pub(crate) fn check_transition(id: ContainerId, from: ContainerState, to: ContainerState) -> Result<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            tracing::warn!(container = %id, %from, %to, "rejected container state transition");
            Err(FlashError::InvalidContainerState(format!(
                "container {}: {} -> {} not allowed",
                id, from, to
            )))
        }
    }

    /// Move a container to `to` only if it is currently `from`
    pub(crate) fn transition_from(
        &self,
        id: ContainerId,
        from: ContainerState,
        to: ContainerState,
    ) -> Result<()> {
        let block = self.slot(id)?;
        let mut data = block.data.write();
        if data.state != from {
            return Err(FlashError::InvalidContainerState(format!(
                "container {} is {}, expected {}",
                id, data.state, from
            )));
        }
        Self::check_transition(id, from, to)?;
        data.state = to;
        tracing::debug!(container = %id, %from, %to, "container state transition");
        Ok(())
    }

    /// Attach a handle and move to `to` in one step
    pub(crate) fn attach(
        &self,
        id: ContainerId,
        handle: Arc<ContainerHandle>,
        to: ContainerState,
    ) -> Result<()> {
        let block = self.slot(id)?;
        let mut data = block.data.write();
        Self::check_transition(id, data.state, to)?;
        data.state = to;
        data.read_only = handle.is_read_only();
        data.handle = Some(handle);
        Ok(())
    }

    /// Detach the handle, if any
    pub(crate) fn detach(&self, id: ContainerId) -> Option<Arc<ContainerHandle>> {
        self.block(id).data.write().handle.take()
    }

    /// Rename in the directory and the control block together.
    /// Caller holds `container_op`.
    pub(crate) fn rename(&self, id: ContainerId, new_name: &str) -> Result<()> {
        let block = self.slot(id)?;
        let mut data = block.data.write();
        self.names.rename(&data.name, new_name)?;
        data.name = new_name.to_string();
        Ok(())
    }

    pub(crate) fn set_read_only(&self, id: ContainerId, read_only: bool) -> Result<()> {
        self.slot(id)?.data.write().read_only = read_only;
        Ok(())
    }

    // =========================================================================
    // Shutdown & Introspection
    // =========================================================================

    /// Refuse all new I/O from now on
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Identifiers of every bound slot with its state
    pub fn registered(&self) -> Vec<(ContainerId, ContainerState)> {
        self.slots
            .iter()
            .skip(ContainerId::FIRST_USER as usize)
            .filter_map(|block| {
                let state = block.state();
                (state != ContainerState::Uninitialized).then(|| (block.id(), state))
            })
            .collect()
    }
}
