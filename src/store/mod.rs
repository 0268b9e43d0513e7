//! Object Store Module
//!
//! The flash object store: opaque key → blob storage that everything else in
//! the crate persists into.
//!
//! ## Responsibilities
//! - Create/read/write/delete/flush of objects by key
//! - Separate namespaces per container
//! - Two object kinds: typed (fixed-size index nodes, small records) and
//!   raw (variably sized overflow payloads)
//! - Honour the per-write sync level
//!
//! ## Object File Format (FileStore)
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "FTOB" (4) | Version: u16 (2) | Len: u32 (4)   │
//! │   CRC32 of payload: u32 (4)                             │
//! ├─────────────────────────────────────────────────────────┤
//! │ Payload (Len bytes)                                     │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod file;
mod memory;

use bytes::Bytes;

use crate::error::Result;
use crate::types::{ContainerId, Durability};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Which namespace of a container an object lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Structured objects: index nodes, metadata records, flat-mode values
    Typed,
    /// Unstructured, larger objects: overflow nodes
    Raw,
}

/// Existence precondition for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `ObjectExists` if the key is already present
    Create,
    /// Insert or overwrite
    Set,
}

/// How far a write must be pushed before it is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncMode {
    None,
    Software,
    Hardware,
}

impl From<Durability> for SyncMode {
    fn from(durability: Durability) -> Self {
        match durability {
            Durability::Periodic => SyncMode::None,
            Durability::SoftwareCrashSafe => SyncMode::Software,
            Durability::HardwareCrashSafe => SyncMode::Hardware,
        }
    }
}

/// Opaque key → blob storage shared by every container
///
/// Missing objects are reported as `FlashError::ObjectNotFound`.
pub trait ObjectStore: Send + Sync {
    /// Read a whole object
    fn read(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<Bytes>;

    /// Write a whole object
    fn write(
        &self,
        cid: ContainerId,
        kind: ObjectKind,
        key: &[u8],
        data: &[u8],
        mode: WriteMode,
        sync: SyncMode,
    ) -> Result<()>;

    /// Remove an object
    fn delete(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<()>;

    /// Make one object durable
    fn flush(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<()>;

    /// Make every object of a container durable
    fn flush_container(&self, cid: ContainerId) -> Result<()>;

    /// Enumerate the keys of one namespace of a container
    fn keys(&self, cid: ContainerId, kind: ObjectKind) -> Result<Vec<Vec<u8>>>;

    /// Longest object key this store accepts
    fn max_key_len(&self) -> usize {
        usize::MAX
    }

    /// Check for an object without reading it
    fn contains(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<bool> {
        match self.read(cid, kind, key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
