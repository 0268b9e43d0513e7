//! Snapshot coordinator

use std::sync::Arc;
use std::time::Duration;

use crate::error::{FlashError, Result};
use crate::registry::{ContainerRef, IoMode};
use crate::sequence::SequenceAllocator;
use crate::types::SequenceNumber;

/// Creates, deletes and lists snapshot marks
pub struct SnapshotCoordinator {
    sequence: Arc<SequenceAllocator>,
    max_snapshots: usize,
    drain_timeout: Duration,
}

impl SnapshotCoordinator {
    pub fn new(sequence: Arc<SequenceAllocator>, max_snapshots: usize, drain_timeout: Duration) -> Self {
        Self {
            sequence,
            max_snapshots,
            drain_timeout,
        }
    }

    /// Take a snapshot of an open, ordered container
    ///
    /// Every write admitted before the call is visible as of the returned
    /// mark; every write admitted after it is not.
    pub fn create(&self, cref: &ContainerRef<'_>) -> Result<SequenceNumber> {
        let block = cref.block();
        let _serial = block.snapshot_lock.lock();
        // Keeps close from draining the container underneath us
        let _pin = cref.begin_io(IoMode::Read)?;
        let handle = cref.handle()?;
        let index = handle.index()?;

        let held = index.snapshots().len();
        if held >= self.max_snapshots {
            tracing::warn!(container = %cref.id(), held, limit = self.max_snapshots, "snapshot limit reached");
            return Err(FlashError::TooManySnapshots {
                limit: self.max_snapshots,
            });
        }

        let drained = block.gate.begin_drain(self.drain_timeout)?;
        handle.flush()?;
        let seq = self.sequence.alloc()?;
        index.add_snapshot(seq)?;
        drop(drained);

        tracing::info!(container = %cref.id(), seq, "snapshot created");
        Ok(seq)
    }

    /// Drop a snapshot mark; versions only it kept are pruned
    pub fn delete(&self, cref: &ContainerRef<'_>, seq: SequenceNumber) -> Result<()> {
        let _serial = cref.block().snapshot_lock.lock();
        let _pin = cref.begin_io(IoMode::Read)?;
        cref.handle()?.index()?.remove_snapshot(seq)?;
        tracing::info!(container = %cref.id(), seq, "snapshot deleted");
        Ok(())
    }

    /// Marks currently held, ascending
    pub fn list(&self, cref: &ContainerRef<'_>) -> Result<Vec<SequenceNumber>> {
        let _pin = cref.begin_io(IoMode::Read)?;
        Ok(cref.handle()?.index()?.snapshots())
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }
}
