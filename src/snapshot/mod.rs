//! Snapshot Module
//!
//! Point-in-time marks on ordered containers.
//!
//! ## Create Protocol
//! ```text
//!   snapshot_lock ─► pin (read) ─► gate: Idle → Draining
//!                                        │ wait writers == 0
//!                                        ▼
//!                                   Snapshotting ─► flush ─► alloc seq ─► persist mark
//!                                        │
//!   guard dropped (success or error) ────┴──► Idle, writers woken
//! ```
//! Readers never wait on any of this; writers wait (bounded) at the gate.

mod coordinator;
mod gate;

pub use coordinator::SnapshotCoordinator;
pub use gate::{DrainGuard, SnapshotGate, SnapshotPhase};
