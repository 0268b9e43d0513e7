//! Versioned ordered index
//!
//! Keeps a version chain per key so reads can be served as of any snapshot
//! mark. Chains live in memory and are persisted through `NodeIo`:
//!
//! - entries are serialized and spread over regular pages, written
//!   copy-on-write (fresh node ids each flush, old pages freed after the
//!   root points at the new ones); a chain of page-table nodes lists them
//! - values longer than the inline threshold go to overflow nodes as soon as
//!   they are written
//! - node 0 holds `RootMeta`
//!
//! Versions are pruned eagerly: a chain keeps its newest version plus, for
//! each snapshot, the newest version at or below that mark.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};
use crate::node::NodeIo;
use crate::types::{NodeId, SequenceNumber};

use super::{frame, unframe, PageTable, RootMeta, RootStatus, FRAME_HEADER, ROOT_NODE};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoredValue {
    Inline(Vec<u8>),
    Overflow { node: NodeId, len: u64 },
    Tombstone,
}

impl StoredValue {
    fn live_len(&self) -> Option<u64> {
        match self {
            StoredValue::Inline(v) => Some(v.len() as u64),
            StoredValue::Overflow { len, .. } => Some(*len),
            StoredValue::Tombstone => None,
        }
    }

    fn overflow_node(&self) -> Option<NodeId> {
        match self {
            StoredValue::Overflow { node, .. } => Some(*node),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Version {
    seq: SequenceNumber,
    value: StoredValue,
}

type Chain = Vec<Version>;

struct IndexInner {
    root: RootMeta,
    /// Version chains, ascending by sequence number
    entries: BTreeMap<Vec<u8>, Chain>,
    dirty: bool,
    /// Entry pages and page-table nodes the durable root references
    page_ids: Vec<NodeId>,
    table_ids: Vec<NodeId>,
    /// Overflow nodes dropped from memory; deleted once a flush has made a
    /// root that no longer references them durable
    pending_free: Vec<NodeId>,
    /// Regular nodes no root references whose delete has not gone through
    stale_nodes: Vec<NodeId>,
}

/// What a single-key mutation changed, so it can be taken back
struct Undo {
    chain: Option<Chain>,
    live_keys: u64,
    live_bytes: u64,
    pending_free: usize,
    dirty: bool,
}

impl IndexInner {
    fn empty(root: RootMeta) -> Self {
        Self {
            root,
            entries: BTreeMap::new(),
            dirty: false,
            page_ids: Vec::new(),
            table_ids: Vec::new(),
            pending_free: Vec::new(),
            stale_nodes: Vec::new(),
        }
    }

    fn alloc_node(&mut self) -> NodeId {
        let node = self.root.next_node;
        self.root.next_node += 1;
        node
    }

    fn current_len(&self, key: &[u8]) -> Option<u64> {
        self.entries
            .get(key)
            .and_then(|chain| chain.last())
            .and_then(|v| v.value.live_len())
    }

    /// Insert a version into a chain in sequence order, then prune
    fn apply(&mut self, key: &[u8], version: Version) -> Option<u64> {
        let prev = self.current_len(key).map(|len| len + key.len() as u64);

        let chain = self.entries.entry(key.to_vec()).or_default();
        let pos = chain.partition_point(|v| v.seq < version.seq);
        chain.insert(pos, version);

        let freed = prune_chain(chain, &self.root.snapshots);
        if chain.is_empty() {
            self.entries.remove(key);
        }
        self.pending_free.extend(freed);

        let now = self.current_len(key).map(|len| len + key.len() as u64);
        self.account(prev, now);
        self.dirty = true;
        prev
    }

    fn checkpoint(&self, key: &[u8]) -> Undo {
        Undo {
            chain: self.entries.get(key).cloned(),
            live_keys: self.root.live_keys,
            live_bytes: self.root.live_bytes,
            pending_free: self.pending_free.len(),
            dirty: self.dirty,
        }
    }

    fn restore(&mut self, key: &[u8], undo: Undo) {
        match undo.chain {
            Some(chain) => {
                self.entries.insert(key.to_vec(), chain);
            }
            None => {
                self.entries.remove(key);
            }
        }
        self.root.live_keys = undo.live_keys;
        self.root.live_bytes = undo.live_bytes;
        self.pending_free.truncate(undo.pending_free);
        self.dirty = undo.dirty;
    }

    fn account(&mut self, before: Option<u64>, after: Option<u64>) {
        match (before, after) {
            (None, Some(n)) => {
                self.root.live_keys += 1;
                self.root.live_bytes += n;
            }
            (Some(o), None) => {
                self.root.live_keys = self.root.live_keys.saturating_sub(1);
                self.root.live_bytes = self.root.live_bytes.saturating_sub(o);
            }
            (Some(o), Some(n)) => {
                self.root.live_bytes = self.root.live_bytes.saturating_sub(o) + n;
            }
            (None, None) => {}
        }
    }

    fn prune_all(&mut self) -> usize {
        let snapshots = self.root.snapshots.clone();
        let mut dropped = 0;
        self.entries.retain(|_, chain| {
            let before = chain.len();
            let freed = prune_chain(chain, &snapshots);
            dropped += before - chain.len();
            self.pending_free.extend(freed);
            !chain.is_empty()
        });
        if dropped > 0 {
            self.dirty = true;
        }
        dropped
    }
}

/// Drop versions no reader can reach; returns overflow nodes to free
fn prune_chain(chain: &mut Chain, snapshots: &[SequenceNumber]) -> Vec<NodeId> {
    if chain.is_empty() {
        return Vec::new();
    }
    let mut keep = vec![false; chain.len()];
    keep[chain.len() - 1] = true;
    for &mark in snapshots {
        let visible = chain.partition_point(|v| v.seq <= mark);
        if visible > 0 {
            keep[visible - 1] = true;
        }
    }

    let mut freed = Vec::new();
    let mut retained = Vec::with_capacity(chain.len());
    for (version, keep) in chain.drain(..).zip(keep) {
        if keep {
            retained.push(version);
        } else if let Some(node) = version.value.overflow_node() {
            freed.push(node);
        }
    }

    // A tombstone with nothing older behind it hides nothing
    let leading = retained
        .iter()
        .take_while(|v| matches!(v.value, StoredValue::Tombstone))
        .count();
    retained.drain(..leading);

    *chain = retained;
    freed
}

/// Ordered, snapshot-aware index persisted through `NodeIo`
///
/// ## Concurrency:
/// - `inner`: RwLock; reads share it, mutations and flushes take it
///   exclusively
pub struct VersionedIndex {
    nodes: Arc<dyn NodeIo>,
    inline_threshold: usize,
    inner: RwLock<IndexInner>,
}

impl VersionedIndex {
    /// Create an empty index: a fresh root node and no pages
    pub fn create(nodes: Arc<dyn NodeIo>, inline_threshold: usize) -> Result<Self> {
        nodes.create(ROOT_NODE)?;
        let index = Self {
            nodes,
            inline_threshold,
            inner: RwLock::new(IndexInner::empty(RootMeta::default())),
        };
        index.write_root(&index.inner.read().root)?;
        Ok(index)
    }

    /// Load an existing index from its root and pages
    pub fn open(nodes: Arc<dyn NodeIo>, inline_threshold: usize) -> Result<Self> {
        let root = RootMeta::load(nodes.as_ref())?;
        if root.status.contains(RootStatus::OVERFLOW_DELETE_IN_PROGRESS) {
            return Err(FlashError::InvalidContainerState(
                "index is being deleted".into(),
            ));
        }

        let (page_ids, table_ids) = Self::load_page_list(nodes.as_ref(), &root)?;
        let mut body = Vec::with_capacity(root.data_len as usize);
        for &page_id in &page_ids {
            let page = nodes.read(page_id, false)?;
            let chunk = unframe(&page).ok_or_else(|| {
                FlashError::Corruption(format!("index page {} failed validation", page_id))
            })?;
            body.extend_from_slice(chunk);
        }
        if body.len() as u64 != root.data_len || crc32fast::hash(&body) != root.data_crc {
            return Err(FlashError::Corruption(format!(
                "index data mismatch: {} bytes on pages, root records {}",
                body.len(),
                root.data_len
            )));
        }
        let entries = if body.is_empty() {
            BTreeMap::new()
        } else {
            bincode::deserialize(&body)?
        };

        let mut inner = IndexInner::empty(root);
        inner.entries = entries;
        inner.page_ids = page_ids;
        inner.table_ids = table_ids;
        Ok(Self {
            nodes,
            inline_threshold,
            inner: RwLock::new(inner),
        })
    }

    /// Walk the page-table chain; returns the entry pages and the table nodes
    fn load_page_list(nodes: &dyn NodeIo, root: &RootMeta) -> Result<(Vec<NodeId>, Vec<NodeId>)> {
        let mut pages = Vec::new();
        let mut tables = Vec::new();
        let mut next = root.page_table;
        while let Some(table_id) = next {
            let table = PageTable::decode(table_id, &nodes.read(table_id, false)?)?;
            // Every link lists at least one page, so this bounds the walk
            if table.pages.is_empty() || (pages.len() + table.pages.len()) as u64 > root.page_count {
                return Err(FlashError::Corruption(format!(
                    "page table node {} lists more pages than the root's {}",
                    table_id, root.page_count
                )));
            }
            pages.extend(table.pages);
            tables.push(table_id);
            next = table.next;
        }
        if pages.len() as u64 != root.page_count {
            return Err(FlashError::Corruption(format!(
                "page table lists {} pages, root records {}",
                pages.len(),
                root.page_count
            )));
        }
        Ok((pages, tables))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value of `key` now, or as of a snapshot mark
    pub fn get(&self, key: &[u8], as_of: Option<SequenceNumber>) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read();
        if let Some(mark) = as_of {
            if inner.root.snapshots.binary_search(&mark).is_err() {
                return Err(FlashError::SnapshotNotFound(mark));
            }
        }
        let Some(chain) = inner.entries.get(key) else {
            return Ok(None);
        };
        let visible = match as_of {
            Some(mark) => chain.partition_point(|v| v.seq <= mark),
            None => chain.len(),
        };
        let Some(version) = visible.checked_sub(1).map(|i| &chain[i]) else {
            return Ok(None);
        };

        match &version.value {
            StoredValue::Inline(v) => Ok(Some(v.clone())),
            StoredValue::Tombstone => Ok(None),
            StoredValue::Overflow { node, len } => {
                // Read lock held: the node cannot be freed underneath us
                let data = self.nodes.read(*node, true)?;
                if data.len() as u64 != *len {
                    return Err(FlashError::Corruption(format!(
                        "overflow node {} is {} bytes, expected {}",
                        node,
                        data.len(),
                        len
                    )));
                }
                Ok(Some(data))
            }
        }
    }

    /// Live length (key + value) of the current version, if any
    pub fn current_len(&self, key: &[u8]) -> Option<u64> {
        self.inner
            .read()
            .current_len(key)
            .map(|len| len + key.len() as u64)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or replace; returns the previous live length
    ///
    /// With `persist` the change is flushed before returning, and is taken
    /// back out of memory if that flush fails.
    pub fn put(
        &self,
        key: &[u8],
        value: &[u8],
        seq: SequenceNumber,
        persist: bool,
    ) -> Result<Option<u64>> {
        let mut inner = self.inner.write();
        let stored = if value.len() > self.inline_threshold {
            let node = inner.alloc_node();
            self.nodes.write(&[node], &[value], true)?;
            StoredValue::Overflow {
                node,
                len: value.len() as u64,
            }
        } else {
            StoredValue::Inline(value.to_vec())
        };
        let overflow = stored.overflow_node();

        let result = self.commit(&mut inner, key, Version { seq, value: stored }, persist);
        if result.is_err() {
            if let Some(node) = overflow {
                self.try_free(node, true);
            }
        }
        result
    }

    /// Delete; returns the previous live length, None if nothing was live
    pub fn delete(&self, key: &[u8], seq: SequenceNumber, persist: bool) -> Result<Option<u64>> {
        let mut inner = self.inner.write();
        if inner.current_len(key).is_none() {
            return Ok(None);
        }
        let version = Version {
            seq,
            value: StoredValue::Tombstone,
        };
        self.commit(&mut inner, key, version, persist)
    }

    fn commit(
        &self,
        inner: &mut IndexInner,
        key: &[u8],
        version: Version,
        persist: bool,
    ) -> Result<Option<u64>> {
        let undo = persist.then(|| inner.checkpoint(key));
        let prev = inner.apply(key, version);
        if let Some(undo) = undo {
            if let Err(e) = self.flush_locked(inner, false) {
                inner.restore(key, undo);
                return Err(e);
            }
        }
        Ok(prev)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Record a snapshot mark durably
    pub fn add_snapshot(&self, seq: SequenceNumber) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.root.snapshots.binary_search(&seq).is_ok() {
            return Ok(());
        }
        let previous = inner.root.clone();
        let pos = inner.root.snapshots.partition_point(|&s| s < seq);
        inner.root.snapshots.insert(pos, seq);
        if let Err(e) = self.swap_root(&inner.root, &previous) {
            inner.root = previous;
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop a snapshot mark and the versions only it was keeping
    pub fn remove_snapshot(&self, seq: SequenceNumber) -> Result<()> {
        let mut inner = self.inner.write();
        let pos = inner
            .root
            .snapshots
            .binary_search(&seq)
            .map_err(|_| FlashError::SnapshotNotFound(seq))?;

        // Mark first: a crash before the prune lands leaves the bit set
        let previous = inner.root.clone();
        inner.root.snapshots.remove(pos);
        inner.root.status.insert(RootStatus::STALE_ENTRIES_PRESENT);
        if let Err(e) = self.swap_root(&inner.root, &previous) {
            inner.root = previous;
            return Err(e.into());
        }

        // The mark is gone durably from here on. If the pruned pages do not
        // land, the bit stays set on the device and the next open prunes.
        let dropped = inner.prune_all();
        inner.root.status.remove(RootStatus::STALE_ENTRIES_PRESENT);
        if let Err(e) = self.flush_locked(&mut inner, true) {
            tracing::warn!(seq, error = %e, "pruned versions not persisted after snapshot delete");
        }
        tracing::debug!(seq, dropped, "snapshot removed");
        Ok(())
    }

    /// Snapshot marks, ascending
    pub fn snapshots(&self) -> Vec<SequenceNumber> {
        self.inner.read().root.snapshots.clone()
    }

    /// Prune unreachable versions and clear the stale-entries bit
    pub fn scavenge(&self) -> Result<usize> {
        let mut inner = self.inner.write();
        let dropped = inner.prune_all();
        inner.root.status.remove(RootStatus::STALE_ENTRIES_PRESENT);
        self.flush_locked(&mut inner, true)?;
        Ok(dropped)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Persist pending changes
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.flush_locked(&mut inner, false)
    }

    fn flush_locked(&self, inner: &mut IndexInner, force: bool) -> Result<()> {
        if !inner.dirty && !force {
            return Ok(());
        }

        let body = bincode::serialize(&inner.entries)?;
        let mut fresh = Vec::new();
        let (page_ids, table_ids) = match self.stage_pages(inner, &body, &mut fresh) {
            Ok(staged) => staged,
            Err(e) => {
                self.discard(&fresh);
                return Err(e);
            }
        };

        let mut root = inner.root.clone();
        root.page_table = table_ids.first().copied();
        root.page_count = page_ids.len() as u64;
        root.data_len = body.len() as u64;
        root.data_crc = crc32fast::hash(&body);
        if let Err(e) = self.swap_root(&root, &inner.root) {
            if !matches!(e, RootSwapError::Unknown(_)) {
                self.discard(&fresh);
            }
            return Err(e.into_inner());
        }

        // The durable root references only the fresh nodes now
        inner.root = root;
        let old_pages = std::mem::replace(&mut inner.page_ids, page_ids);
        let old_tables = std::mem::replace(&mut inner.table_ids, table_ids);
        inner.stale_nodes.extend(old_pages);
        inner.stale_nodes.extend(old_tables);
        inner.dirty = false;
        self.reclaim(inner);
        Ok(())
    }

    /// Write the entry pages, then the page-table chain listing them, to
    /// fresh nodes. Every node created is pushed to `fresh`.
    fn stage_pages(
        &self,
        inner: &mut IndexInner,
        body: &[u8],
        fresh: &mut Vec<NodeId>,
    ) -> Result<(Vec<NodeId>, Vec<NodeId>)> {
        let node_size = self.nodes.node_size();
        let mut page_ids = Vec::new();
        for chunk in body.chunks(node_size - FRAME_HEADER) {
            let page = frame(chunk, node_size)
                .ok_or_else(|| FlashError::InvalidArgument("page payload exceeds node size".into()))?;
            let node = self.create_page(inner)?;
            fresh.push(node);
            self.nodes.write(&[node], &[page.as_slice()], false)?;
            page_ids.push(node);
        }

        let links: Vec<&[NodeId]> = page_ids.chunks(PageTable::capacity(node_size).max(1)).collect();
        let mut table_ids = Vec::with_capacity(links.len());
        for _ in 0..links.len() {
            let node = self.create_page(inner)?;
            fresh.push(node);
            table_ids.push(node);
        }
        for (i, pages) in links.iter().enumerate() {
            let table = PageTable {
                pages: pages.to_vec(),
                next: table_ids.get(i + 1).copied(),
            };
            let encoded = table.encode(node_size)?;
            self.nodes.write(&[table_ids[i]], &[encoded.as_slice()], false)?;
        }
        Ok((page_ids, table_ids))
    }

    /// Claim a fresh page id, skipping ids orphaned by an earlier crash
    fn create_page(&self, inner: &mut IndexInner) -> Result<NodeId> {
        loop {
            let node = inner.alloc_node();
            match self.nodes.create(node) {
                Ok(_) => return Ok(node),
                Err(FlashError::ObjectExists) => {
                    tracing::debug!(node, "skipping orphaned index page");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_root(&self, root: &RootMeta) -> Result<()> {
        let page = root.encode(self.nodes.node_size())?;
        self.nodes.write(&[ROOT_NODE], &[page.as_slice()], false)?;
        self.nodes.flush(ROOT_NODE)
    }

    /// Publish `root`. On failure, put `previous` back so the device and
    /// memory agree again.
    fn swap_root(&self, root: &RootMeta, previous: &RootMeta) -> std::result::Result<(), RootSwapError> {
        let Err(e) = self.write_root(root) else {
            return Ok(());
        };
        match self.write_root(previous) {
            Ok(()) => Err(RootSwapError::Restored(e)),
            Err(restore) => {
                tracing::error!(error = %e, restore_error = %restore, "index root left in an unknown state");
                Err(RootSwapError::Unknown(e))
            }
        }
    }

    /// Best-effort removal of nodes written for a flush that never committed
    fn discard(&self, fresh: &[NodeId]) {
        for &node in fresh {
            self.try_free(node, false);
        }
    }

    /// Delete nodes no durable root references; failures are retried on the
    /// next flush
    fn reclaim(&self, inner: &mut IndexInner) {
        inner.stale_nodes.retain(|&node| !self.try_free(node, false));
        inner.pending_free.retain(|&node| !self.try_free(node, true));
    }

    /// True once the node is gone
    fn try_free(&self, node: NodeId, is_overflow: bool) -> bool {
        match self.nodes.delete(node, is_overflow) {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                tracing::warn!(node, is_overflow, error = %e, "could not free index node");
                false
            }
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Copy of the in-memory root
    pub fn root(&self) -> RootMeta {
        self.inner.read().root.clone()
    }

    pub fn root_status(&self) -> RootStatus {
        self.inner.read().root.status
    }

    /// Keys with a live current value
    pub fn live_keys(&self) -> u64 {
        self.inner.read().root.live_keys
    }

    /// Bytes of live keys and values
    pub fn live_bytes(&self) -> u64 {
        self.inner.read().root.live_bytes
    }

    /// Stored versions across all keys
    pub fn version_count(&self) -> usize {
        self.inner.read().entries.values().map(Vec::len).sum()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }
}

/// Failure publishing a new root
enum RootSwapError {
    /// The previous root is back in place
    Restored(FlashError),
    /// Neither root could be confirmed; the new one may have landed
    Unknown(FlashError),
}

impl RootSwapError {
    fn into_inner(self) -> FlashError {
        match self {
            RootSwapError::Restored(e) | RootSwapError::Unknown(e) => e,
        }
    }
}

impl From<RootSwapError> for FlashError {
    fn from(err: RootSwapError) -> Self {
        err.into_inner()
    }
}
