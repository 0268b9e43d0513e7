//! Startup recovery
//!
//! Runs once before the engine accepts work:
//!
//! 1. Register every container found in the metadata container as `Closed`
//! 2. Finish every delete that was interrupted (metadata flag, or the
//!    overflow-delete bit in the index root)
//! 3. Prune versions left behind by an interrupted snapshot delete
//!
//! A second pass over the same store finds nothing left to do.

use crate::error::Result;
use crate::index::{RootStatus, VersionedIndex};
use crate::registry::Registration;
use crate::types::ContainerId;

use super::{ContainerHandle, ContainerState, LifecycleManager};

/// What a recovery pass found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Containers registered from metadata (deleted ones included)
    pub registered: usize,
    /// Interrupted deletes carried to completion
    pub deletes_resumed: Vec<ContainerId>,
    /// Containers whose stale versions were pruned
    pub scavenged: Vec<ContainerId>,
}

pub struct Recovery;

impl Recovery {
    pub fn run(lifecycle: &LifecycleManager) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let registry = lifecycle.registry();
        let mut to_delete = Vec::new();

        {
            let _op = registry.container_op();
            for meta in lifecycle.meta().load_all()? {
                registry.claim_id(meta.id)?;
                registry.register(Registration {
                    id: meta.id,
                    name: meta.name.clone(),
                    state: ContainerState::Closed,
                    mode: meta.mode,
                    read_only: meta.read_only,
                    handle: None,
                })?;
                report.registered += 1;

                // A half-deleted index may not have a readable root
                let status = if meta.delete_in_progress {
                    RootStatus::OVERFLOW_DELETE_IN_PROGRESS
                } else {
                    lifecycle.root_status(&meta)?.unwrap_or_default()
                };
                if status.contains(RootStatus::OVERFLOW_DELETE_IN_PROGRESS) {
                    let id = meta.id;
                    lifecycle.mark_delete_pending(id, meta)?;
                    to_delete.push(id);
                    continue;
                }

                if status.contains(RootStatus::STALE_ENTRIES_PRESENT) {
                    let nodes =
                        ContainerHandle::node_adapter(lifecycle.store(), &meta, lifecycle.config());
                    let index = VersionedIndex::open(nodes, lifecycle.config().inline_threshold)?;
                    let dropped = index.scavenge()?;
                    tracing::info!(container = %meta.id, dropped, "scavenged stale versions");
                    report.scavenged.push(meta.id);
                }
            }
        }

        for id in to_delete {
            tracing::info!(container = %id, "resuming interrupted delete");
            lifecycle.finish_delete(id)?;
            report.deletes_resumed.push(id);
        }

        tracing::info!(
            registered = report.registered,
            deletes_resumed = report.deletes_resumed.len(),
            scavenged = report.scavenged.len(),
            "recovery complete"
        );
        Ok(report)
    }
}
