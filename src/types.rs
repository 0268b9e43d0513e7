//! Shared identifier and policy types

use std::fmt;

use serde::{Deserialize, Serialize};

/// A globally monotonic sequence number
pub type SequenceNumber = u64;

/// Logical node id assigned by the index layer
pub type NodeId = u64;

/// Container identifier: the index of the container's control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u32);

impl ContainerId {
    /// Never handed out; marks "no container"
    pub const INVALID: ContainerId = ContainerId(0);

    /// Holds persisted container metadata and stats
    pub const METADATA: ContainerId = ContainerId(1);

    /// Holds the sequence allocator's ceiling
    pub const SEQUENCE: ContainerId = ContainerId(2);

    /// First identifier available to user containers
    pub const FIRST_USER: u32 = 3;

    /// Largest identifier space the registry will allocate
    pub const MAX_CAPACITY: usize = 65_536;

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Internal bookkeeping containers are not user-addressable
    pub fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_USER
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-container crash-safety policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Durability {
    /// Writes reach the device eventually; a crash may lose recent writes
    #[default]
    Periodic,

    /// Survives a process crash
    SoftwareCrashSafe,

    /// Survives power loss
    HardwareCrashSafe,
}

/// How a container maps keys onto objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexMode {
    /// Keys go through the ordered index (snapshots supported)
    #[default]
    Ordered,

    /// Keys are stored directly as objects, bypassing the index
    Flat,
}
