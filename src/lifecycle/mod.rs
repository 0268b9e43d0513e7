//! Lifecycle Module
//!
//! Container state machine and the protocols that drive it.
//!
//! ## Responsibilities
//! - Create/open/close/rename containers, attach and detach their handles
//! - Synchronous and asynchronous delete, resumable after a crash
//! - Persisted metadata and stats in the metadata container
//! - The startup recovery pass
//!
//! ## Open Path
//! ```text
//! open(name)
//!   │
//!   ├─ meta.delete_in_progress? ──yes──► finish delete, report not found
//!   ├─ root OVERFLOW_DELETE?     ──yes──► finish delete, report not found
//!   ├─ load index + stats
//!   ├─ root STALE_ENTRIES?       ──yes──► scavenge
//!   └─ attach handle, Closed → Open
//! ```

mod delete;
mod handle;
mod manager;
mod meta;
mod recovery;
mod state;

pub use delete::AsyncDeleter;
pub use handle::ContainerHandle;
pub use manager::{ContainerInfo, LifecycleManager, HIDDEN_PREFIX};
pub use meta::{ContainerMeta, MetaStore};
pub use recovery::{Recovery, RecoveryReport};
pub use state::{ContainerState, IndexState};
