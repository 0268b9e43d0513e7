//! Node Module
//!
//! Persistence of index nodes as flash objects.
//!
//! ## Responsibilities
//! - The five callbacks the index calls to move nodes in and out of flash
//! - Fixed-width, restart-stable node keys
//! - Durability translation and optional compression on every write
//!
//! ## Node Key Format
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────┐
//! │ Container id: u32 BE │ Logical node id: u64 BE              │
//! └──────────────────────┴──────────────────────────────────────┘
//!                        12 bytes
//! ```
//!
//! Regular nodes are typed objects exactly `node_size` long. Overflow nodes
//! (values too big to inline) are raw objects of any length.

mod adapter;
mod compress;

use crate::error::{FlashError, Result};
use crate::types::{ContainerId, NodeId};

pub use adapter::NodeAdapter;
pub use compress::{Compressor, ZstdCompressor};

/// Width of an encoded node key
pub const NODE_KEY_LEN: usize = 12;

/// Callbacks an index uses to persist its nodes
pub trait NodeIo: Send + Sync {
    /// Fetch a node; regular nodes come back exactly `node_size` long
    fn read(&self, node: NodeId, is_overflow: bool) -> Result<Vec<u8>>;

    /// Store a batch of nodes; `nodes` and `data` pair up by position
    fn write(&self, nodes: &[NodeId], data: &[&[u8]], is_overflow: bool) -> Result<()>;

    /// Create a regular node that must not exist yet; returns the zeroed page
    fn create(&self, node: NodeId) -> Result<Vec<u8>>;

    /// Remove a node
    fn delete(&self, node: NodeId, is_overflow: bool) -> Result<()>;

    /// Make a node durable
    fn flush(&self, node: NodeId) -> Result<()>;

    /// Size of regular nodes
    fn node_size(&self) -> usize;
}

/// (container, logical node id): the object key of an index node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub container: ContainerId,
    pub node: NodeId,
}

impl NodeKey {
    pub fn new(container: ContainerId, node: NodeId) -> Self {
        Self { container, node }
    }

    pub fn encode(&self) -> [u8; NODE_KEY_LEN] {
        let mut key = [0u8; NODE_KEY_LEN];
        key[0..4].copy_from_slice(&self.container.as_u32().to_be_bytes());
        key[4..12].copy_from_slice(&self.node.to_be_bytes());
        key
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_KEY_LEN {
            return Err(FlashError::Corruption(format!(
                "node key must be {} bytes, got {}",
                NODE_KEY_LEN,
                bytes.len()
            )));
        }
        let mut cid = [0u8; 4];
        let mut node = [0u8; 8];
        cid.copy_from_slice(&bytes[0..4]);
        node.copy_from_slice(&bytes[4..12]);
        Ok(Self {
            container: ContainerId(u32::from_be_bytes(cid)),
            node: u64::from_be_bytes(node),
        })
    }
}
