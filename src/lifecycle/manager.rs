//! Lifecycle Manager
//!
//! Drives containers through their state machine: create, open, close,
//! delete (synchronous and asynchronous), rename.
//!
//! ## Delete Protocol
//! ```text
//! 1. close if open                     (drain I/O, flush, detach)
//! 2. meta.delete_in_progress = true    (durable; recovery resumes from here)
//! 3. Closed → DeletePending            [async: rename to hidden name, enqueue]
//! 4. DeletePending → DeleteOpen        (exclusive claim; given back if 5-6 fail)
//! 5. root |= OVERFLOW_DELETE_IN_PROGRESS
//! 6. delete raw objects, then typed objects, root last
//! 7. DeleteOpen → DeleteClosed
//! 8. remove stats, remove metadata     (commit point)
//! 9. release identifier                (DeleteClosed → Uninitialized)
//! ```
//! Every step tolerates having run before, so a crash anywhere replays to
//! the same end state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Config, ContainerConfig};
use crate::error::{FlashError, Result};
use crate::index::{RootMeta, RootStatus, ROOT_NODE};
use crate::node::NodeKey;
use crate::registry::{ContainerLookup, Registration, Registry};
use crate::store::{ObjectKind, ObjectStore};
use crate::types::{ContainerId, IndexMode, SequenceNumber};

use super::meta::ignore_missing;
use super::{ContainerHandle, ContainerMeta, ContainerState, IndexState, MetaStore};

/// Names starting with this are reserved for containers being deleted
pub const HIDDEN_PREFIX: &str = "$deleted.";

/// Snapshot of a container's externally visible state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub state: ContainerState,
    /// Present while the container is open
    pub index_state: Option<IndexState>,
    pub mode: IndexMode,
    pub read_only: bool,
    pub size_limit: u64,
    pub objects: u64,
    pub live_bytes: u64,
    pub snapshots: Vec<SequenceNumber>,
}

/// Result of trying to open a container
enum OpenOutcome {
    Opened,
    /// The container was mid-delete; it has been queued for completion
    ResumeDelete,
}

/// Owns the registry and runs every container-level protocol
pub struct LifecycleManager {
    config: Config,
    store: Arc<dyn ObjectStore>,
    registry: Registry,
    meta: MetaStore,
    delete_counter: AtomicU64,
}

impl LifecycleManager {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        let registry = Registry::new(
            config.max_containers,
            std::time::Duration::from_millis(config.drain_timeout_ms),
            std::time::Duration::from_millis(config.snapshot_wait_timeout_ms),
        );
        Self {
            meta: MetaStore::new(store.clone()),
            config,
            store,
            registry,
            delete_counter: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FlashError::InvalidArgument("container name is empty".into()));
        }
        if name.starts_with(HIDDEN_PREFIX) {
            return Err(FlashError::InvalidArgument(format!(
                "container names starting with {:?} are reserved",
                HIDDEN_PREFIX
            )));
        }
        Ok(())
    }

    fn user_state(&self, id: ContainerId) -> Result<ContainerState> {
        let state = self.registry.block(id).state();
        if !state.is_user_visible() {
            return Err(FlashError::ContainerNotFound(id.to_string()));
        }
        Ok(state)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create and open a new container
    pub fn create(&self, name: &str, config: &ContainerConfig) -> Result<ContainerId> {
        Self::validate_name(name)?;
        let _op = self.registry.container_op();
        if self.registry.is_shutting_down() {
            return Err(FlashError::ShuttingDown);
        }
        if self.registry.names().contains(name) {
            return Err(FlashError::ContainerExists(name.to_string()));
        }

        let id = self.registry.allocate_id()?;
        match self.create_locked(id, name, config) {
            Ok(()) => {
                tracing::info!(container = %id, name, mode = ?config.mode, "container created");
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(container = %id, name, error = %e, "container create failed");
                if let Err(cleanup) = self.purge_objects(id).and_then(|_| self.meta.remove(id)) {
                    tracing::warn!(container = %id, error = %cleanup, "cleanup after failed create");
                }
                self.registry.return_id(id);
                Err(e)
            }
        }
    }

    fn create_locked(&self, id: ContainerId, name: &str, config: &ContainerConfig) -> Result<()> {
        // Leftovers from an earlier owner of this id that crashed mid-create
        self.purge_objects(id)?;

        let meta = ContainerMeta::new(id, name, config);
        let handle = ContainerHandle::create(self.store.clone(), &meta, &self.config)?;
        handle.flush()?;
        self.meta.save_stats(id, &handle.stats().record())?;
        // The metadata record is what makes the container exist
        self.meta.save(&meta)?;

        handle.set_index_state(IndexState::Open)?;
        self.registry.register(Registration {
            id,
            name: name.to_string(),
            state: ContainerState::Open,
            mode: meta.mode,
            read_only: meta.read_only,
            handle: Some(Arc::new(handle)),
        })
    }

    // =========================================================================
    // Open / Close
    // =========================================================================

    /// Open a closed container
    ///
    /// A container found mid-delete has its delete finished instead and is
    /// reported as not found.
    pub fn open(&self, lookup: impl Into<ContainerLookup>) -> Result<ContainerId> {
        let (id, outcome) = {
            let _op = self.registry.container_op();
            let id = self.registry.resolve(&lookup.into())?;
            (id, self.open_locked(id)?)
        };

        match outcome {
            OpenOutcome::Opened => Ok(id),
            OpenOutcome::ResumeDelete => {
                tracing::warn!(container = %id, "open found an interrupted delete, resuming it");
                self.finish_delete(id)?;
                Err(FlashError::ContainerNotFound(id.to_string()))
            }
        }
    }

    fn open_locked(&self, id: ContainerId) -> Result<OpenOutcome> {
        if self.registry.is_shutting_down() {
            return Err(FlashError::ShuttingDown);
        }
        let from = self.user_state(id)?;
        Registry::check_transition(id, from, ContainerState::Open)?;

        let meta = self.meta.load(id)?;
        let status = if meta.delete_in_progress {
            None
        } else {
            self.root_status(&meta)?
        };
        if meta.delete_in_progress
            || status.is_some_and(|s| s.contains(RootStatus::OVERFLOW_DELETE_IN_PROGRESS))
        {
            self.mark_delete_pending(id, meta)?;
            return Ok(OpenOutcome::ResumeDelete);
        }

        let stats = self.meta.load_stats(id)?;
        let handle = ContainerHandle::open(self.store.clone(), &meta, &self.config, stats)?;
        if status.is_some_and(|s| s.contains(RootStatus::STALE_ENTRIES_PRESENT)) {
            let dropped = handle.index()?.scavenge()?;
            tracing::info!(container = %id, dropped, "scavenged stale versions on open");
        }
        handle.set_index_state(IndexState::Open)?;
        self.registry.attach(id, Arc::new(handle), ContainerState::Open)?;
        tracing::info!(container = %id, name = %meta.name, "container opened");
        Ok(OpenOutcome::Opened)
    }

    /// Close an open container: refuse new I/O, drain, flush, detach
    pub fn close(&self, lookup: impl Into<ContainerLookup>) -> Result<()> {
        let _op = self.registry.container_op();
        let id = self.registry.resolve(&lookup.into())?;
        self.user_state(id)?;
        self.close_locked(id, false)
    }

    fn close_locked(&self, id: ContainerId, for_delete: bool) -> Result<()> {
        self.registry
            .transition_from(id, ContainerState::Open, ContainerState::Closed)?;

        if let Err(e) = self.registry.wait_drained(id) {
            self.registry
                .transition_from(id, ContainerState::Closed, ContainerState::Open)?;
            tracing::warn!(container = %id, error = %e, "close gave up waiting for I/O");
            return Err(e);
        }

        let Some(handle) = self.registry.block(id).handle() else {
            return Ok(());
        };
        handle.set_index_state(IndexState::Closing)?;
        let flushed = handle
            .flush()
            .and_then(|_| self.meta.save_stats(id, &handle.stats().record()));
        if let Err(e) = flushed {
            handle.set_index_state(IndexState::Open)?;
            self.registry
                .transition_from(id, ContainerState::Closed, ContainerState::Open)?;
            tracing::warn!(container = %id, error = %e, "close failed to flush, container stays open");
            return Err(e);
        }
        handle.set_index_state(IndexState::Closed)?;
        if for_delete {
            handle.set_index_state(IndexState::Deleting)?;
            handle.set_index_state(IndexState::Unused)?;
        }
        self.registry.detach(id);
        tracing::info!(container = %id, "container closed");
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a container and everything in it before returning
    ///
    /// Calling it again on a container whose earlier delete failed part way
    /// picks that delete up where it stopped.
    pub fn delete(&self, lookup: impl Into<ContainerLookup>) -> Result<()> {
        let id = {
            let _op = self.registry.container_op();
            let id = self.registry.resolve(&lookup.into())?;
            let state = self.registry.block(id).state();
            if matches!(state, ContainerState::DeletePending | ContainerState::DeleteClosed) {
                tracing::info!(container = %id, %state, "resuming interrupted delete");
            } else {
                if self.user_state(id)? == ContainerState::Open {
                    self.close_locked(id, true)?;
                }
                let mut meta = self.meta.load(id)?;
                meta.delete_in_progress = true;
                self.mark_delete_pending(id, meta)?;
            }
            id
        };
        self.finish_delete(id)
    }

    /// First half of an asynchronous delete
    ///
    /// Hides the container under a fresh name and leaves it `DeletePending`;
    /// the caller hands the returned id to a worker running
    /// [`finish_delete`](Self::finish_delete).
    pub fn begin_delete_async(&self, lookup: impl Into<ContainerLookup>) -> Result<ContainerId> {
        let _op = self.registry.container_op();
        let id = self.registry.resolve(&lookup.into())?;
        if self.user_state(id)? == ContainerState::Open {
            self.close_locked(id, true)?;
        }

        let mut meta = self.meta.load(id)?;
        let hidden = self.hidden_name(&meta.name);
        meta.original_name = Some(std::mem::replace(&mut meta.name, hidden.clone()));
        meta.delete_in_progress = true;
        let original = meta.original_name.clone().unwrap_or_default();

        self.mark_delete_pending(id, meta)?;
        self.registry.rename(id, &hidden)?;
        tracing::info!(container = %id, name = %original, hidden = %hidden, "container queued for delete");
        Ok(id)
    }

    /// Unique across concurrent deletes and restarts
    fn hidden_name(&self, name: &str) -> String {
        loop {
            let candidate = format!(
                "{}{}.{:08x}.{}",
                HIDDEN_PREFIX,
                self.delete_counter.fetch_add(1, Ordering::SeqCst),
                rand::random::<u32>(),
                name
            );
            if !self.registry.names().contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Persist the delete flag, then move Closed → DeletePending.
    /// Caller holds `container_op`.
    pub(crate) fn mark_delete_pending(&self, id: ContainerId, mut meta: ContainerMeta) -> Result<()> {
        let state = self.registry.block(id).state();
        Registry::check_transition(id, state, ContainerState::DeletePending)?;
        meta.delete_in_progress = true;
        self.meta.save(&meta)?;
        self.registry
            .transition_from(id, state, ContainerState::DeletePending)
    }

    /// Second half of any delete: remove every object, then the metadata,
    /// then free the identifier
    ///
    /// Safe to call again after a failure or crash at any point.
    pub fn finish_delete(&self, id: ContainerId) -> Result<()> {
        let name = self.registry.block(id).name();
        match self.registry.block(id).state() {
            ContainerState::DeletePending => {
                // Exclusive claim: only one caller gets past this transition
                if let Err(e) = self.registry.transition_from(
                    id,
                    ContainerState::DeletePending,
                    ContainerState::DeleteOpen,
                ) {
                    tracing::debug!(container = %id, error = %e, "delete claimed elsewhere");
                    return Ok(());
                }
                let removed = match self.remove_contents(id) {
                    Ok(removed) => removed,
                    Err(e) => {
                        // Give the claim back so a retry can pick it up
                        self.registry.transition_from(
                            id,
                            ContainerState::DeleteOpen,
                            ContainerState::DeletePending,
                        )?;
                        tracing::warn!(container = %id, error = %e, "delete stopped part way");
                        return Err(e);
                    }
                };
                self.registry.transition_from(
                    id,
                    ContainerState::DeleteOpen,
                    ContainerState::DeleteClosed,
                )?;
                tracing::debug!(container = %id, removed, "container objects removed");
            }
            ContainerState::DeleteOpen => {
                tracing::debug!(container = %id, "delete already in progress");
                return Ok(());
            }
            // An earlier attempt got as far as releasing the identifier
            ContainerState::DeleteClosed => {}
            state => {
                return Err(FlashError::InvalidContainerState(format!(
                    "container {} is {}, not being deleted",
                    id, state
                )))
            }
        }

        self.meta.remove_stats(id)?;
        self.meta.remove(id)?;
        {
            let _op = self.registry.container_op();
            if self.registry.block(id).state() == ContainerState::DeleteClosed {
                self.registry.release_id(id)?;
            }
        }
        tracing::info!(container = %id, name = %name, "container deleted");
        Ok(())
    }

    /// Mark the root, then delete every object
    fn remove_contents(&self, id: ContainerId) -> Result<usize> {
        let meta = self.meta.load(id)?;
        if meta.mode == IndexMode::Ordered {
            let nodes = ContainerHandle::node_adapter(&self.store, &meta, &self.config);
            match RootMeta::update_status(
                nodes.as_ref(),
                RootStatus::OVERFLOW_DELETE_IN_PROGRESS,
                true,
            ) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(FlashError::Corruption(_)) => {
                    tracing::warn!(container = %id, "index root unreadable, deleting anyway");
                }
                Err(e) => return Err(e),
            }
        }
        self.purge_objects(id)
    }

    /// Delete every object of a container; the index root goes last
    fn purge_objects(&self, id: ContainerId) -> Result<usize> {
        let mut removed = 0;
        for key in self.store.keys(id, ObjectKind::Raw)? {
            ignore_missing(self.store.delete(id, ObjectKind::Raw, &key))?;
            removed += 1;
        }

        let root = NodeKey::new(id, ROOT_NODE).encode();
        let mut saw_root = false;
        for key in self.store.keys(id, ObjectKind::Typed)? {
            if key.as_slice() == root.as_slice() {
                saw_root = true;
                continue;
            }
            ignore_missing(self.store.delete(id, ObjectKind::Typed, &key))?;
            removed += 1;
        }
        if saw_root {
            ignore_missing(self.store.delete(id, ObjectKind::Typed, &root))?;
            removed += 1;
        }
        Ok(removed)
    }

    // =========================================================================
    // Rename / Flags
    // =========================================================================

    pub fn rename(&self, lookup: impl Into<ContainerLookup>, new_name: &str) -> Result<()> {
        Self::validate_name(new_name)?;
        let _op = self.registry.container_op();
        let id = self.registry.resolve(&lookup.into())?;
        self.user_state(id)?;
        if self.registry.names().contains(new_name) {
            return Err(FlashError::ContainerExists(new_name.to_string()));
        }

        let mut meta = self.meta.load(id)?;
        let old = std::mem::replace(&mut meta.name, new_name.to_string());
        self.meta.save(&meta)?;
        self.registry.rename(id, new_name)?;
        tracing::info!(container = %id, from = %old, to = new_name, "container renamed");
        Ok(())
    }

    pub fn set_read_only(&self, lookup: impl Into<ContainerLookup>, read_only: bool) -> Result<()> {
        let _op = self.registry.container_op();
        let id = self.registry.resolve(&lookup.into())?;
        self.user_state(id)?;

        let mut meta = self.meta.load(id)?;
        meta.read_only = read_only;
        self.meta.save(&meta)?;
        self.registry.set_read_only(id, read_only)?;
        if let Some(handle) = self.registry.block(id).handle() {
            handle.set_read_only(read_only);
        }
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Describe a container in any registered state
    pub fn info(&self, lookup: impl Into<ContainerLookup>) -> Result<ContainerInfo> {
        let id = self.registry.resolve(&lookup.into())?;
        let cref = self.registry.acquire_internal(id)?;
        let block = cref.block();
        let meta = self.meta.load(id)?;

        let mut info = ContainerInfo {
            id,
            name: block.name(),
            state: block.state(),
            index_state: None,
            mode: meta.mode,
            read_only: block.is_read_only(),
            size_limit: meta.size_limit,
            objects: 0,
            live_bytes: 0,
            snapshots: Vec::new(),
        };

        match block.handle() {
            Some(handle) => {
                info.index_state = Some(handle.index_state());
                info.objects = handle.stats().objects();
                info.live_bytes = handle.stats().live_bytes();
                if let Ok(index) = handle.index() {
                    info.snapshots = index.snapshots();
                }
            }
            None => {
                let stats = self.meta.load_stats(id)?;
                info.objects = stats.objects;
                info.live_bytes = stats.live_bytes;
                if meta.mode == IndexMode::Ordered {
                    let nodes = ContainerHandle::node_adapter(&self.store, &meta, &self.config);
                    match RootMeta::load(nodes.as_ref()) {
                        Ok(root) => {
                            info.objects = root.live_keys;
                            info.live_bytes = root.live_bytes;
                            info.snapshots = root.snapshots;
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(info)
    }

    /// Every open or closed container, in identifier order
    pub fn list(&self) -> Result<Vec<ContainerInfo>> {
        self.registry
            .registered()
            .into_iter()
            .filter(|(_, state)| state.is_user_visible())
            .map(|(id, _)| self.info(id))
            .collect()
    }

    /// Root status of an ordered container, None if it has no root
    pub(crate) fn root_status(&self, meta: &ContainerMeta) -> Result<Option<RootStatus>> {
        if meta.mode != IndexMode::Ordered {
            return Ok(None);
        }
        let nodes = ContainerHandle::node_adapter(&self.store, meta, &self.config);
        match RootMeta::load(nodes.as_ref()) {
            Ok(root) => Ok(Some(root.status)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Refuse new I/O and close every open container
    ///
    /// Keeps going past individual failures; the first one is returned.
    pub fn shutdown(&self) -> Result<()> {
        self.registry.begin_shutdown();
        let _op = self.registry.container_op();

        let mut first_err = None;
        for (id, state) in self.registry.registered() {
            if state != ContainerState::Open {
                continue;
            }
            if let Err(e) = self.close_locked(id, false) {
                tracing::error!(container = %id, error = %e, "close during shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        tracing::info!("lifecycle manager shut down");
        first_err.map_or(Ok(()), Err)
    }
}
