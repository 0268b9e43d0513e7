//! Open-container handle
//!
//! Attached to a control block while the container is open. Owns the node
//! adapter, the index (ordered mode) and the live stats.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{FlashError, Result};
use crate::index::VersionedIndex;
use crate::node::{Compressor, NodeAdapter, ZstdCompressor};
use crate::stats::{ContainerStats, StatsRecord};
use crate::store::{ObjectKind, ObjectStore, SyncMode, WriteMode};
use crate::types::{ContainerId, IndexMode, SequenceNumber};

use super::{ContainerMeta, IndexState};

/// Live state of an open container
///
/// ## Concurrency:
/// - `apply_lock`: serializes the size check with the mutation it admits
/// - `index_state`: Mutex, changed only by the lifecycle manager
/// - `stats`: atomics
pub struct ContainerHandle {
    id: ContainerId,
    mode: IndexMode,
    size_limit: u64,
    read_only: AtomicBool,
    store: Arc<dyn ObjectStore>,
    sync: SyncMode,
    nodes: Arc<NodeAdapter>,
    index: Option<VersionedIndex>,
    stats: ContainerStats,
    index_state: Mutex<IndexState>,
    apply_lock: Mutex<()>,
}

impl ContainerHandle {
    /// Handle for a container created just now: fresh index, zeroed stats
    pub fn create(store: Arc<dyn ObjectStore>, meta: &ContainerMeta, config: &Config) -> Result<Self> {
        let nodes = Self::node_adapter(&store, meta, config);
        let index = match meta.mode {
            IndexMode::Ordered => Some(VersionedIndex::create(
                nodes.clone(),
                config.inline_threshold,
            )?),
            IndexMode::Flat => None,
        };
        Ok(Self::assemble(store, meta, nodes, index, StatsRecord::default()))
    }

    /// Handle for an existing container: load the index, replay stats
    pub fn open(
        store: Arc<dyn ObjectStore>,
        meta: &ContainerMeta,
        config: &Config,
        mut stats: StatsRecord,
    ) -> Result<Self> {
        let nodes = Self::node_adapter(&store, meta, config);
        let index = match meta.mode {
            IndexMode::Ordered => {
                let index = VersionedIndex::open(nodes.clone(), config.inline_threshold)?;
                // The root is flushed more often than the stats record
                stats.objects = index.live_keys();
                stats.live_bytes = index.live_bytes();
                Some(index)
            }
            IndexMode::Flat => None,
        };
        Ok(Self::assemble(store, meta, nodes, index, stats))
    }

    pub(crate) fn node_adapter(
        store: &Arc<dyn ObjectStore>,
        meta: &ContainerMeta,
        config: &Config,
    ) -> Arc<NodeAdapter> {
        let compressor: Option<Arc<dyn Compressor>> = meta
            .compression
            .then(|| Arc::new(ZstdCompressor::default()) as Arc<dyn Compressor>);
        Arc::new(NodeAdapter::new(
            store.clone(),
            meta.id,
            config.node_size,
            meta.durability,
            compressor,
        ))
    }

    fn assemble(
        store: Arc<dyn ObjectStore>,
        meta: &ContainerMeta,
        nodes: Arc<NodeAdapter>,
        index: Option<VersionedIndex>,
        stats: StatsRecord,
    ) -> Self {
        Self {
            id: meta.id,
            mode: meta.mode,
            size_limit: meta.size_limit,
            read_only: AtomicBool::new(meta.read_only),
            sync: meta.durability.into(),
            store,
            nodes,
            index,
            stats: ContainerStats::from_record(stats),
            index_state: Mutex::new(IndexState::Init),
            apply_lock: Mutex::new(()),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub(crate) fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn nodes(&self) -> &Arc<NodeAdapter> {
        &self.nodes
    }

    pub fn stats(&self) -> &ContainerStats {
        &self.stats
    }

    /// The ordered index; flat containers have none
    pub fn index(&self) -> Result<&VersionedIndex> {
        self.index.as_ref().ok_or_else(|| {
            FlashError::Unsupported(format!("container {} has no ordered index", self.id))
        })
    }

    pub fn index_state(&self) -> IndexState {
        *self.index_state.lock()
    }

    pub(crate) fn set_index_state(&self, to: IndexState) -> Result<()> {
        let mut state = self.index_state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            tracing::warn!(container = %self.id, %from, %to, "rejected index state transition");
            return Err(FlashError::InvalidContainerState(format!(
                "index of container {}: {} -> {} not allowed",
                self.id, from, to
            )));
        }
        *state = to;
        Ok(())
    }

    // =========================================================================
    // Key/Value
    // =========================================================================

    pub fn put(&self, key: &[u8], value: &[u8], seq: SequenceNumber) -> Result<()> {
        self.check_flat_key(key)?;
        let _apply = self.apply_lock.lock();
        let prev = self.live_len(key)?;
        let now = (key.len() + value.len()) as u64;
        self.check_limit(prev, now)?;

        let replaced = match &self.index {
            Some(index) => index.put(key, value, seq, self.crash_safe())?,
            None => {
                self.store
                    .write(self.id, ObjectKind::Typed, key, value, WriteMode::Set, self.sync)?;
                prev
            }
        };
        self.stats.on_put(replaced, now);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_flat_key(key)?;
        self.stats.on_get();
        match &self.index {
            Some(index) => index.get(key, None),
            None => match self.store.read(self.id, ObjectKind::Typed, key) {
                Ok(bytes) => Ok(Some(bytes.to_vec())),
                Err(FlashError::ObjectNotFound) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    pub fn get_as_of(&self, key: &[u8], seq: SequenceNumber) -> Result<Option<Vec<u8>>> {
        self.stats.on_get();
        self.index()?.get(key, Some(seq))
    }

    /// Returns whether a live value was removed
    pub fn delete(&self, key: &[u8], seq: SequenceNumber) -> Result<bool> {
        self.check_flat_key(key)?;
        let _apply = self.apply_lock.lock();
        let prev = match &self.index {
            Some(index) => index.delete(key, seq, self.crash_safe())?,
            None => {
                let prev = self.live_len(key)?;
                if prev.is_some() {
                    self.store.delete(self.id, ObjectKind::Typed, key)?;
                }
                prev
            }
        };
        self.stats.on_delete(prev);
        Ok(prev.is_some())
    }

    /// Push the index and every object of the container to the device
    pub fn flush(&self) -> Result<()> {
        if let Some(index) = &self.index {
            index.flush()?;
        }
        self.store.flush_container(self.id)
    }

    /// Crash-safe containers persist the index before acknowledging a write
    fn crash_safe(&self) -> bool {
        self.sync != SyncMode::None
    }

    /// Flat keys become object names, which the store may cap
    fn check_flat_key(&self, key: &[u8]) -> Result<()> {
        let max = self.store.max_key_len();
        if self.index.is_none() && key.len() > max {
            return Err(FlashError::InvalidArgument(format!(
                "key of {} bytes exceeds the {}-byte limit for flat containers",
                key.len(),
                max
            )));
        }
        Ok(())
    }

    /// Live length (key + value) of the current value of `key`
    fn live_len(&self, key: &[u8]) -> Result<Option<u64>> {
        match &self.index {
            Some(index) => Ok(index.current_len(key)),
            None => match self.store.read(self.id, ObjectKind::Typed, key) {
                Ok(bytes) => Ok(Some((key.len() + bytes.len()) as u64)),
                Err(FlashError::ObjectNotFound) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    fn check_limit(&self, prev: Option<u64>, now: u64) -> Result<()> {
        if self.size_limit == 0 {
            return Ok(());
        }
        let projected = self
            .stats
            .live_bytes()
            .saturating_sub(prev.unwrap_or(0))
            .saturating_add(now);
        if projected > self.size_limit {
            return Err(FlashError::exhausted(format!(
                "container {} full: {} of {} bytes",
                self.id, projected, self.size_limit
            )));
        }
        Ok(())
    }
}
