//! Index Module
//!
//! The ordered index attached to an open container, and the root metadata
//! every index keeps in node 0.
//!
//! ## Root Node Layout (node 0, `node_size` bytes)
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────────┬─────────┐
//! │ Len: u32 LE  │ CRC: u32 LE  │ RootMeta (bincode, Len) │ zeroes  │
//! └──────────────┴──────────────┴─────────────────────────┴─────────┘
//! ```
//!
//! The status word in `RootMeta` carries the crash-recovery triggers checked
//! on every open.
//!
//! ## Page List
//! The root does not hold the entry pages directly; it points at the head of
//! a chain of page-table nodes, so the root stays the same size however
//! large the index grows:
//! ```text
//! root ──page_table──► [pages 0..k, next] ──► [pages k..2k, next] ──► ...
//! ```

mod versioned;

use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};
use crate::node::NodeIo;
use crate::types::{NodeId, SequenceNumber};

pub use versioned::VersionedIndex;

/// Node id of the root node
pub const ROOT_NODE: NodeId = 0;

/// Len (4) + CRC (4) in front of a serialized root or page
pub(crate) const FRAME_HEADER: usize = 8;

/// Status word persisted in the index root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RootStatus(u32);

impl RootStatus {
    /// The container is being torn down; opening it must resume the delete
    pub const OVERFLOW_DELETE_IN_PROGRESS: RootStatus = RootStatus(0x1);

    /// Versions no snapshot needs may still be stored; prune on open
    pub const STALE_ENTRIES_PRESENT: RootStatus = RootStatus(0x2);

    pub fn empty() -> Self {
        RootStatus(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: RootStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RootStatus) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RootStatus) {
        self.0 &= !other.0;
    }
}

/// Metadata stored in the root node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMeta {
    pub status: RootStatus,
    /// Snapshot marks, ascending
    pub snapshots: Vec<SequenceNumber>,
    /// First node of the page-table chain, None while the index is empty
    pub page_table: Option<NodeId>,
    /// Entry pages listed across the chain
    pub page_count: u64,
    /// Next unassigned logical node id
    pub next_node: NodeId,
    /// Serialized entry bytes spread across the entry pages
    pub data_len: u64,
    /// CRC32 of those bytes
    pub data_crc: u32,
    /// Live (current, non-tombstone) keys
    pub live_keys: u64,
    /// Bytes of live keys plus values
    pub live_bytes: u64,
}

impl Default for RootMeta {
    fn default() -> Self {
        Self {
            status: RootStatus::empty(),
            snapshots: Vec::new(),
            page_table: None,
            page_count: 0,
            next_node: ROOT_NODE + 1,
            data_len: 0,
            data_crc: 0,
            live_keys: 0,
            live_bytes: 0,
        }
    }
}

impl RootMeta {
    /// Serialize into a full root node
    pub fn encode(&self, node_size: usize) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        frame(&body, node_size).ok_or_else(|| {
            FlashError::exhausted(format!(
                "root metadata ({} bytes) does not fit a {}-byte node",
                body.len(),
                node_size
            ))
        })
    }

    /// Whether a root carrying `snapshots` marks fits a `node_size` node
    pub fn fits(node_size: usize, snapshots: usize) -> bool {
        let root = RootMeta {
            snapshots: vec![SequenceNumber::MAX; snapshots],
            page_table: Some(NodeId::MAX),
            ..Default::default()
        };
        bincode::serialized_size(&root)
            .map(|len| len as usize + FRAME_HEADER <= node_size)
            .unwrap_or(false)
    }

    /// Parse a root node
    pub fn decode(page: &[u8]) -> Result<Self> {
        let body = unframe(page)
            .ok_or_else(|| FlashError::Corruption("index root node failed validation".into()))?;
        Ok(bincode::deserialize(body)?)
    }

    /// Read just the root of an index without loading it
    pub fn load(nodes: &dyn NodeIo) -> Result<Self> {
        Self::decode(&nodes.read(ROOT_NODE, false)?)
    }

    /// Rewrite the root with a status bit set or cleared, without loading the
    /// index. Used by delete, which may run against a half-deleted index.
    pub fn update_status(nodes: &dyn NodeIo, bit: RootStatus, set: bool) -> Result<Self> {
        let mut root = Self::load(nodes)?;
        if set {
            root.status.insert(bit);
        } else {
            root.status.remove(bit);
        }
        let page = root.encode(nodes.node_size())?;
        nodes.write(&[ROOT_NODE], &[page.as_slice()], false)?;
        nodes.flush(ROOT_NODE)?;
        Ok(root)
    }
}

/// One link of the page-table chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PageTable {
    /// Entry pages, in order
    pub pages: Vec<NodeId>,
    pub next: Option<NodeId>,
}

impl PageTable {
    /// Page ids one table node holds
    pub(crate) fn capacity(node_size: usize) -> usize {
        // Vec length (8) + Option tag and id (9), then 8 bytes per id
        node_size.saturating_sub(FRAME_HEADER + 8 + 9) / 8
    }

    pub(crate) fn encode(&self, node_size: usize) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        frame(&body, node_size).ok_or_else(|| {
            FlashError::InvalidArgument(format!(
                "page table of {} ids does not fit a {}-byte node",
                self.pages.len(),
                node_size
            ))
        })
    }

    pub(crate) fn decode(node: NodeId, page: &[u8]) -> Result<Self> {
        let body = unframe(page).ok_or_else(|| {
            FlashError::Corruption(format!("page table node {} failed validation", node))
        })?;
        Ok(bincode::deserialize(body)?)
    }
}

/// Pad `body` into a checksummed page; None if it does not fit
pub(crate) fn frame(body: &[u8], page_size: usize) -> Option<Vec<u8>> {
    if body.len() + FRAME_HEADER > page_size {
        return None;
    }
    let mut page = vec![0u8; page_size];
    page[0..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
    page[4..8].copy_from_slice(&crc32fast::hash(body).to_le_bytes());
    page[FRAME_HEADER..FRAME_HEADER + body.len()].copy_from_slice(body);
    Some(page)
}

/// Payload of a framed page; None if the frame is invalid
pub(crate) fn unframe(page: &[u8]) -> Option<&[u8]> {
    if page.len() < FRAME_HEADER {
        return None;
    }
    let len = u32::from_le_bytes([page[0], page[1], page[2], page[3]]) as usize;
    let crc = u32::from_le_bytes([page[4], page[5], page[6], page[7]]);
    let body = page.get(FRAME_HEADER..FRAME_HEADER + len)?;
    (crc32fast::hash(body) == crc).then_some(body)
}
