//! Node persistence adapter
//!
//! Maps `NodeIo` calls for one container onto object-store calls.

use std::sync::Arc;

use crate::error::{fatal, FlashError, Result};
use crate::store::{ObjectKind, ObjectStore, SyncMode, WriteMode};
use crate::types::{ContainerId, Durability, NodeId};

use super::{Compressor, NodeIo, NodeKey};

/// Leading byte of a node stored by a compressing adapter
const TAG_PLAIN: u8 = 0;
const TAG_COMPRESSED: u8 = 1;

/// Persists one container's index nodes into the object store
pub struct NodeAdapter {
    store: Arc<dyn ObjectStore>,
    container: ContainerId,
    node_size: usize,
    sync: SyncMode,
    compressor: Option<Arc<dyn Compressor>>,
}

impl NodeAdapter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        container: ContainerId,
        node_size: usize,
        durability: Durability,
        compressor: Option<Arc<dyn Compressor>>,
    ) -> Self {
        Self {
            store,
            container,
            node_size,
            sync: durability.into(),
            compressor,
        }
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    /// Sync level every write is issued with
    pub fn sync_mode(&self) -> SyncMode {
        self.sync
    }

    pub fn is_compressing(&self) -> bool {
        self.compressor.is_some()
    }

    fn key(&self, node: NodeId) -> [u8; super::NODE_KEY_LEN] {
        NodeKey::new(self.container, node).encode()
    }

    fn kind(is_overflow: bool) -> ObjectKind {
        if is_overflow {
            ObjectKind::Raw
        } else {
            ObjectKind::Typed
        }
    }

    /// Bytes as they go to the store
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let Some(compressor) = &self.compressor else {
            return Ok(data.to_vec());
        };
        let packed = compressor.compress(data)?;
        let mut out = Vec::with_capacity(1 + packed.len().min(data.len()));
        if packed.len() < data.len() {
            out.push(TAG_COMPRESSED);
            out.extend_from_slice(&packed);
        } else {
            out.push(TAG_PLAIN);
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    /// Bytes as the index sees them
    fn decode(&self, node: NodeId, stored: &[u8]) -> Result<Vec<u8>> {
        let Some(compressor) = &self.compressor else {
            return Ok(stored.to_vec());
        };
        match stored.split_first() {
            Some((&TAG_PLAIN, rest)) => Ok(rest.to_vec()),
            Some((&TAG_COMPRESSED, rest)) => compressor.decompress(rest),
            _ => Err(FlashError::Corruption(format!(
                "node {} of container {} has no compression tag",
                node, self.container
            ))),
        }
    }

    fn check_node_len(&self, node: NodeId, len: usize) -> Result<()> {
        if len != self.node_size {
            return Err(FlashError::InvalidArgument(format!(
                "node {} is {} bytes, node size is {}",
                node, len, self.node_size
            )));
        }
        Ok(())
    }
}

impl NodeIo for NodeAdapter {
    fn read(&self, node: NodeId, is_overflow: bool) -> Result<Vec<u8>> {
        let stored = self
            .store
            .read(self.container, Self::kind(is_overflow), &self.key(node))?;
        let data = self.decode(node, &stored)?;
        if !is_overflow && data.len() != self.node_size {
            return Err(FlashError::Corruption(format!(
                "node {} of container {} is {} bytes, expected {}",
                node,
                self.container,
                data.len(),
                self.node_size
            )));
        }
        Ok(data)
    }

    fn write(&self, nodes: &[NodeId], data: &[&[u8]], is_overflow: bool) -> Result<()> {
        if nodes.len() != data.len() {
            return Err(FlashError::InvalidArgument(format!(
                "{} node ids but {} buffers",
                nodes.len(),
                data.len()
            )));
        }
        for (&node, bytes) in nodes.iter().zip(data) {
            if !is_overflow {
                self.check_node_len(node, bytes.len())?;
            }
            let encoded = self.encode(bytes)?;
            self.store.write(
                self.container,
                Self::kind(is_overflow),
                &self.key(node),
                &encoded,
                WriteMode::Set,
                self.sync,
            )?;
        }
        Ok(())
    }

    fn create(&self, node: NodeId) -> Result<Vec<u8>> {
        let zeroed = vec![0u8; self.node_size];
        let encoded = self.encode(&zeroed)?;
        self.store.write(
            self.container,
            ObjectKind::Typed,
            &self.key(node),
            &encoded,
            WriteMode::Create,
            self.sync,
        )?;

        // The object exists now; not being able to read it back means the
        // store lost a write it acknowledged
        match self.read(node, false) {
            Ok(page) => Ok(page),
            Err(e) => fatal(format!(
                "node {} of container {} unreadable right after create: {}",
                node, self.container, e
            )),
        }
    }

    fn delete(&self, node: NodeId, is_overflow: bool) -> Result<()> {
        self.store
            .delete(self.container, Self::kind(is_overflow), &self.key(node))
    }

    fn flush(&self, node: NodeId) -> Result<()> {
        let key = self.key(node);
        match self.store.flush(self.container, ObjectKind::Typed, &key) {
            Err(e) if e.is_not_found() => self.store.flush(self.container, ObjectKind::Raw, &key),
            other => other,
        }
    }

    fn node_size(&self) -> usize {
        self.node_size
    }
}
