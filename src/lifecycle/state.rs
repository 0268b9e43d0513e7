//! Container lifecycle states
//!
//! Two machines run side by side: `ContainerState` lives in the control
//! block and gates I/O, `IndexState` lives in the attached handle and tracks
//! the index adapter.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Registry-level lifecycle of a container identifier
///
/// ```text
///  Uninitialized ──create──► Open ◄──open── Closed ◄── (recovery register)
///        ▲                    │              ▲  │
///        │                    └────close─────┘  │ delete
///        │                                      ▼
///   DeleteClosed ◄──close── DeleteOpen ◄────► DeletePending
///        │                     (claim / purge failed)
///        └──────── release id ──────► Uninitialized
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ContainerState {
    #[default]
    Uninitialized,
    Open,
    Closed,
    DeletePending,
    DeleteOpen,
    DeleteClosed,
}

impl ContainerState {
    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Uninitialized, Open)
                | (Uninitialized, Closed)
                | (Closed, Open)
                | (Open, Closed)
                | (Closed, DeletePending)
                | (DeletePending, DeleteOpen)
                | (DeleteOpen, DeletePending)
                | (DeleteOpen, DeleteClosed)
                | (DeleteClosed, Uninitialized)
        )
    }

    /// Any of the three delete states
    pub fn is_deleting(self) -> bool {
        matches!(
            self,
            ContainerState::DeletePending | ContainerState::DeleteOpen | ContainerState::DeleteClosed
        )
    }

    /// Visible to callers through `acquire`
    pub fn is_user_visible(self) -> bool {
        matches!(self, ContainerState::Open | ContainerState::Closed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse state of the index adapter attached to an open container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IndexState {
    #[default]
    Init,
    Open,
    Closing,
    Closed,
    Deleting,
    Unused,
}

impl IndexState {
    pub fn can_transition_to(self, next: IndexState) -> bool {
        use IndexState::*;
        matches!(
            (self, next),
            (Init, Open)
                | (Init, Deleting)
                | (Open, Closing)
                | (Closing, Closed)
                | (Closing, Open)
                | (Open, Deleting)
                | (Closed, Deleting)
                | (Deleting, Unused)
                | (Closed, Unused)
        )
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
