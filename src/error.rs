//! Error types for flashtree
//!
//! Provides a unified error type for all operations, plus the `fatal` escape
//! hatch for states that can only be reached through a programming error.

use thiserror::Error;

use crate::types::{ContainerId, SequenceNumber};

/// Result type alias using FlashError
pub type Result<T> = std::result::Result<T, FlashError>;

/// Unified error type for flashtree operations
#[derive(Debug, Error)]
pub enum FlashError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Object not found")]
    ObjectNotFound,

    #[error("Snapshot {0} not found")]
    SnapshotNotFound(SequenceNumber),

    // -------------------------------------------------------------------------
    // State Errors
    // -------------------------------------------------------------------------
    #[error("Invalid container state: {0}")]
    InvalidContainerState(String),

    #[error("Container {0} is read-only")]
    ReadOnly(ContainerId),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Object already exists")]
    ObjectExists,

    #[error("Store is shutting down")]
    ShuttingDown,

    // -------------------------------------------------------------------------
    // Contention Errors
    // -------------------------------------------------------------------------
    #[error("Busy: {0}")]
    Busy(String),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Too many snapshots (limit {limit})")]
    TooManySnapshots { limit: usize },

    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of a [`FlashError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown container, object or snapshot. The caller may recover.
    NotFound,
    /// Operation not legal in the current lifecycle state.
    InvalidState,
    /// Contention; retry later.
    Busy,
    /// Identifier space, container quota or device space ran out.
    ResourceExhausted,
    /// Device-level failure.
    Io,
    /// Persisted data failed validation.
    Corruption,
    /// Bad argument or configuration.
    Invalid,
}

impl FlashError {
    /// Map this error onto the taxonomy callers branch on
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::ContainerNotFound(_)
            | FlashError::ObjectNotFound
            | FlashError::SnapshotNotFound(_) => ErrorKind::NotFound,
            FlashError::InvalidContainerState(_)
            | FlashError::ReadOnly(_)
            | FlashError::ContainerExists(_)
            | FlashError::ObjectExists
            | FlashError::ShuttingDown => ErrorKind::InvalidState,
            FlashError::Busy(_) => ErrorKind::Busy,
            FlashError::ResourceExhausted(_) | FlashError::TooManySnapshots { .. } => {
                ErrorKind::ResourceExhausted
            }
            FlashError::Io(_) => ErrorKind::Io,
            FlashError::Corruption(_) | FlashError::Serialization(_) => ErrorKind::Corruption,
            FlashError::InvalidArgument(_) | FlashError::Unsupported(_) | FlashError::Config(_) => {
                ErrorKind::Invalid
            }
        }
    }

    /// True for any not-found flavour
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Build a resource-exhaustion error and log it; these are never silent.
    pub(crate) fn exhausted(what: impl Into<String>) -> Self {
        let what = what.into();
        tracing::warn!(reason = %what, "resource exhausted");
        FlashError::ResourceExhausted(what)
    }
}

impl From<bincode::Error> for FlashError {
    fn from(err: bincode::Error) -> Self {
        FlashError::Serialization(err.to_string())
    }
}

/// Abort on an inconsistency that only a bug can produce.
///
/// Continuing past one of these risks silent data loss, so the error is
/// logged and the thread panics instead of returning.
#[cold]
#[track_caller]
pub(crate) fn fatal(msg: impl std::fmt::Display) -> ! {
    tracing::error!(reason = %msg, "fatal inconsistency");
    panic!("flashtree fatal: {}", msg)
}
