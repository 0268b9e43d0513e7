//! Engine Module
//!
//! The public façade that wires every component together.
//!
//! ## Responsibilities
//! - Open the object store and the sequence allocator
//! - Run crash recovery before accepting work
//! - Route container, key/value and snapshot calls through the registry
//! - Own the background delete workers

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ContainerConfig};
use crate::error::{FlashError, Result};
use crate::lifecycle::{AsyncDeleter, ContainerInfo, LifecycleManager, Recovery, RecoveryReport};
use crate::registry::{ContainerLookup, ContainerRef, IoMode, Registry};
use crate::sequence::SequenceAllocator;
use crate::snapshot::SnapshotCoordinator;
use crate::store::{FileStore, ObjectStore};
use crate::types::{ContainerId, SequenceNumber};

/// The flashtree engine
///
/// ## Concurrency Model
///
/// - **Container operations** (create/open/close/delete/rename): serialized
///   by the registry's container-operation lock
/// - **Writes** (put/delete): admitted per container through `begin_io`;
///   they run concurrently and wait only while a snapshot drains
/// - **Reads** (get/get_as_of): admitted per container, never wait
/// - **Async deletes**: finished by background workers
///
/// Every mutation is stamped with a number from the shared allocator while
/// its writer slot is held, which is what orders it against snapshots.
pub struct Engine {
    config: Config,
    lifecycle: Arc<LifecycleManager>,
    sequence: Arc<SequenceAllocator>,
    snapshots: SnapshotCoordinator,
    deleter: AsyncDeleter,
    recovery: RecoveryReport,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const OBJECTS_DIR: &'static str = "objects";

    /// Open or create an engine on disk
    ///
    /// On startup:
    /// 1. Create the data directory
    /// 2. Open the file-backed object store
    /// 3. Continue as [`open_with_store`](Self::open_with_store)
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let store = FileStore::open(&config.data_dir.join(Self::OBJECTS_DIR))?;
        Self::open_with_store(config, Arc::new(store))
    }

    /// Open an engine over any object store
    ///
    /// On startup:
    /// 1. Resume the sequence allocator past its persisted ceiling
    /// 2. Re-register containers and finish interrupted deletes
    /// 3. Spawn the delete workers
    pub fn open_with_store(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;

        let sequence = Arc::new(SequenceAllocator::open(
            store.clone(),
            config.sequence_batch_size,
            config.sequence_sync_interval,
        )?);
        let lifecycle = Arc::new(LifecycleManager::new(config.clone(), store));
        let recovery = Recovery::run(&lifecycle)?;
        let deleter = AsyncDeleter::spawn(lifecycle.clone(), config.async_delete_workers)?;
        let snapshots = SnapshotCoordinator::new(
            sequence.clone(),
            config.max_snapshots,
            Duration::from_millis(config.snapshot_wait_timeout_ms),
        );

        tracing::info!(
            containers = recovery.registered,
            cursor = sequence.cursor(),
            "engine open"
        );

        Ok(Self {
            config,
            lifecycle,
            sequence,
            snapshots,
            deleter,
            recovery,
        })
    }

    // =========================================================================
    // Container Operations
    // =========================================================================

    /// Create a container; it starts out open
    pub fn create_container(&self, name: &str, config: &ContainerConfig) -> Result<ContainerId> {
        self.lifecycle.create(name, config)
    }

    pub fn open_container(&self, lookup: impl Into<ContainerLookup>) -> Result<ContainerId> {
        self.lifecycle.open(lookup)
    }

    pub fn close_container(&self, lookup: impl Into<ContainerLookup>) -> Result<()> {
        self.lifecycle.close(lookup)
    }

    /// Delete a container and all of its objects before returning
    pub fn delete_container(&self, lookup: impl Into<ContainerLookup>) -> Result<()> {
        self.lifecycle.delete(lookup)
    }

    /// Hide a container and leave the object removal to the background
    /// workers. The name is free for reuse as soon as this returns.
    pub fn delete_container_async(&self, lookup: impl Into<ContainerLookup>) -> Result<ContainerId> {
        let id = self.lifecycle.begin_delete_async(lookup)?;
        self.deleter.enqueue(id)?;
        Ok(id)
    }

    pub fn rename_container(&self, lookup: impl Into<ContainerLookup>, new_name: &str) -> Result<()> {
        self.lifecycle.rename(lookup, new_name)
    }

    pub fn set_read_only(&self, lookup: impl Into<ContainerLookup>, read_only: bool) -> Result<()> {
        self.lifecycle.set_read_only(lookup, read_only)
    }

    /// Identifier of a container by name
    pub fn container_id(&self, name: &str) -> Result<ContainerId> {
        self.registry().resolve(&ContainerLookup::from(name))
    }

    pub fn container_info(&self, lookup: impl Into<ContainerLookup>) -> Result<ContainerInfo> {
        self.lifecycle.info(lookup)
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.lifecycle.list()
    }

    /// Counted reference to an open or closed container
    pub fn acquire(&self, lookup: impl Into<ContainerLookup>) -> Result<ContainerRef<'_>> {
        self.registry().acquire(lookup)
    }

    // =========================================================================
    // Key/Value Operations
    // =========================================================================

    /// Put a key-value pair; returns the sequence number stamped on it
    pub fn put(
        &self,
        lookup: impl Into<ContainerLookup>,
        key: &[u8],
        value: &[u8],
    ) -> Result<SequenceNumber> {
        Self::check_key(key)?;
        let cref = self.acquire(lookup)?;
        let _io = cref.begin_io(IoMode::Write)?;
        let handle = cref.handle()?;
        let seq = self.sequence.alloc()?;
        handle.put(key, value, seq)?;
        Ok(seq)
    }

    /// Current value of a key
    pub fn get(&self, lookup: impl Into<ContainerLookup>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Self::check_key(key)?;
        let cref = self.acquire(lookup)?;
        let _io = cref.begin_io(IoMode::Read)?;
        cref.handle()?.get(key)
    }

    /// Value of a key as of a snapshot mark
    pub fn get_as_of(
        &self,
        lookup: impl Into<ContainerLookup>,
        key: &[u8],
        snapshot: SequenceNumber,
    ) -> Result<Option<Vec<u8>>> {
        Self::check_key(key)?;
        let cref = self.acquire(lookup)?;
        let _io = cref.begin_io(IoMode::Read)?;
        cref.handle()?.get_as_of(key, snapshot)
    }

    /// Delete a key; returns whether a live value was removed
    pub fn delete(&self, lookup: impl Into<ContainerLookup>, key: &[u8]) -> Result<bool> {
        Self::check_key(key)?;
        let cref = self.acquire(lookup)?;
        let _io = cref.begin_io(IoMode::Write)?;
        let handle = cref.handle()?;
        let seq = self.sequence.alloc()?;
        handle.delete(key, seq)
    }

    /// Make everything written to a container so far durable
    pub fn flush_container(&self, lookup: impl Into<ContainerLookup>) -> Result<()> {
        let cref = self.acquire(lookup)?;
        let _io = cref.begin_io(IoMode::Read)?;
        cref.handle()?.flush()
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(FlashError::InvalidArgument("empty key".into()));
        }
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn create_snapshot(&self, lookup: impl Into<ContainerLookup>) -> Result<SequenceNumber> {
        let cref = self.acquire(lookup)?;
        self.snapshots.create(&cref)
    }

    pub fn delete_snapshot(&self, lookup: impl Into<ContainerLookup>, seq: SequenceNumber) -> Result<()> {
        let cref = self.acquire(lookup)?;
        self.snapshots.delete(&cref, seq)
    }

    pub fn list_snapshots(&self, lookup: impl Into<ContainerLookup>) -> Result<Vec<SequenceNumber>> {
        let cref = self.acquire(lookup)?;
        self.snapshots.list(&cref)
    }

    // =========================================================================
    // Background Work & Shutdown
    // =========================================================================

    /// Wait for queued asynchronous deletes; false on timeout
    pub fn wait_for_deletes(&self, timeout: Duration) -> bool {
        self.deleter.wait_idle(timeout)
    }

    pub fn pending_deletes(&self) -> usize {
        self.deleter.pending()
    }

    /// Drain the delete queue, refuse new I/O, close every open container
    pub fn shutdown(self) -> Result<()> {
        let Engine {
            lifecycle, deleter, ..
        } = self;
        deleter.shutdown();
        lifecycle.shutdown()?;
        tracing::info!("engine shut down");
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        self.lifecycle.registry()
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn sequence(&self) -> &Arc<SequenceAllocator> {
        &self.sequence
    }

    /// What the startup recovery pass did
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }
}
