//! # flashtree
//!
//! A flash-resident key-value engine built from:
//! - A container registry with counted references and RAII I/O admission
//! - An index node persistence adapter over a flash object store
//! - Point-in-time snapshots that drain writers, never readers
//! - Crash-safe monotonic sequence numbers
//! - Container lifecycle with crash-resumable asynchronous delete
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │        (containers, key/value, snapshots, shutdown)         │
//! └──────┬──────────────────┬──────────────────┬────────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌─────────────┐   ┌───────────────┐   ┌─────────────┐
//! │  Lifecycle  │   │   Snapshot    │   │  Sequence   │
//! │ (+ deleter) │   │  Coordinator  │   │  Allocator  │
//! └──────┬──────┘   └───────┬───────┘   └──────┬──────┘
//!        │                  │                  │
//!        ▼                  ▼                  │
//! ┌─────────────────────────────────┐          │
//! │ Registry (control blocks, gate) │          │
//! └──────────────┬──────────────────┘          │
//!                ▼                             │
//!        ┌───────────────┐                     │
//!        │ Index + Nodes │                     │
//!        └───────┬───────┘                     │
//!                ▼                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Object Store (file / memory)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod types;

pub mod engine;
pub mod index;
pub mod lifecycle;
pub mod node;
pub mod registry;
pub mod sequence;
pub mod snapshot;
pub mod stats;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, ContainerConfig};
pub use engine::Engine;
pub use error::{ErrorKind, FlashError, Result};
pub use lifecycle::{ContainerInfo, ContainerState, IndexState, RecoveryReport};
pub use registry::{ContainerLookup, ContainerRef, IoGuard, IoMode};
pub use store::{FileStore, MemoryStore, ObjectStore};
pub use types::{ContainerId, Durability, IndexMode, NodeId, SequenceNumber};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of flashtree
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
