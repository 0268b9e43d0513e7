//! Sequence allocator
//!
//! One owned service object; the engine injects it wherever numbers are
//! needed.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};
use crate::store::{ObjectKind, ObjectStore, SyncMode, WriteMode};
use crate::types::{ContainerId, SequenceNumber};

/// Key of the ceiling record inside the sequence container
const CEILING_KEY: &[u8] = b"ceiling";

#[derive(Debug, Serialize, Deserialize)]
struct CeilingRecord {
    ceiling: SequenceNumber,
}

#[derive(Debug)]
struct CounterState {
    /// Next number to grant
    cursor: SequenceNumber,
    /// Highest number that may be granted without another durable write
    ceiling: SequenceNumber,
}

/// Allocates sequence numbers against a persisted ceiling
///
/// ## Concurrency:
/// - `state`: one mutex guarding cursor and ceiling; the ceiling write
///   happens while it is held, so no number beyond a durable ceiling ever
///   leaves the allocator.
pub struct SequenceAllocator {
    store: Arc<dyn ObjectStore>,
    batch_size: u64,
    sync_interval: u64,
    state: Mutex<CounterState>,
}

impl SequenceAllocator {
    /// Open the allocator, resuming just past the persisted ceiling
    pub fn open(store: Arc<dyn ObjectStore>, batch_size: u64, sync_interval: u64) -> Result<Self> {
        if batch_size == 0 || sync_interval < batch_size {
            return Err(FlashError::Config(format!(
                "invalid sequence settings: batch {} interval {}",
                batch_size, sync_interval
            )));
        }

        let ceiling = match store.read(ContainerId::SEQUENCE, ObjectKind::Typed, CEILING_KEY) {
            Ok(bytes) => bincode::deserialize::<CeilingRecord>(&bytes)?.ceiling,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };

        tracing::info!(ceiling, "sequence allocator resuming past persisted ceiling");

        Ok(Self {
            store,
            batch_size,
            sync_interval,
            state: Mutex::new(CounterState {
                cursor: ceiling + 1,
                ceiling,
            }),
        })
    }

    /// Allocate one sequence number
    ///
    /// Every call observes a number larger than any number returned before,
    /// by this allocator or by any earlier incarnation on the same store.
    pub fn alloc(&self) -> Result<SequenceNumber> {
        Ok(self.grant(1)?.start)
    }

    /// Create a calling context that draws numbers in blocks
    pub fn context(&self) -> SequenceContext<'_> {
        SequenceContext {
            allocator: self,
            block: 0..0,
        }
    }

    /// Grant `count` consecutive numbers
    pub fn grant(&self, count: u64) -> Result<Range<SequenceNumber>> {
        if count == 0 || count > self.sync_interval {
            return Err(FlashError::InvalidArgument(format!(
                "cannot grant {} sequence numbers",
                count
            )));
        }

        let mut state = self.state.lock();
        let end = state
            .cursor
            .checked_add(count)
            .ok_or_else(|| FlashError::exhausted("sequence number space"))?;

        // Ceiling within one block of the cursor: advance it first
        if end.saturating_add(self.batch_size) > state.ceiling {
            let next_ceiling = state
                .ceiling
                .max(end - 1)
                .checked_add(self.sync_interval)
                .ok_or_else(|| FlashError::exhausted("sequence number space"))?;
            self.persist_ceiling(next_ceiling)?;
            tracing::debug!(
                old_ceiling = state.ceiling,
                new_ceiling = next_ceiling,
                "advanced sequence ceiling"
            );
            state.ceiling = next_ceiling;
        }

        let start = state.cursor;
        state.cursor = end;
        Ok(start..end)
    }

    /// Durably write the ceiling (and its predecessor is then obsolete)
    fn persist_ceiling(&self, ceiling: SequenceNumber) -> Result<()> {
        let record = bincode::serialize(&CeilingRecord { ceiling })?;
        self.store.write(
            ContainerId::SEQUENCE,
            ObjectKind::Typed,
            CEILING_KEY,
            &record,
            WriteMode::Set,
            SyncMode::Hardware,
        )
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Next number the allocator would grant
    pub fn cursor(&self) -> SequenceNumber {
        self.state.lock().cursor
    }

    /// Ceiling most recently made durable
    pub fn persisted_ceiling(&self) -> SequenceNumber {
        self.state.lock().ceiling
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }
}

/// A caller's reservation window
///
/// Numbers from one context increase monotonically, but two contexts hold
/// disjoint blocks, so numbers from different contexts do not order by time.
/// Mutations that must order against snapshots use
/// [`SequenceAllocator::alloc`].
pub struct SequenceContext<'a> {
    allocator: &'a SequenceAllocator,
    block: Range<SequenceNumber>,
}

impl SequenceContext<'_> {
    /// Take the next number from the block, refilling it when exhausted
    pub fn alloc(&mut self) -> Result<SequenceNumber> {
        if self.block.is_empty() {
            self.block = self.allocator.grant(self.allocator.batch_size)?;
        }
        let seq = self.block.start;
        self.block.start += 1;
        Ok(seq)
    }

    /// Numbers left in the current block
    pub fn remaining(&self) -> u64 {
        self.block.end - self.block.start
    }
}
