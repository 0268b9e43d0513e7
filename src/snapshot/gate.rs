//! Writer/snapshot gate
//!
//! Per-container mutex + condvar pair, separate from the control block's
//! reader/writer lock. The writer count lives inside the gate, so a writer
//! can only be admitted while the phase is `Idle`.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{fatal, FlashError, Result};

/// Where a container is in the snapshot protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    /// Writers admitted
    Idle,
    /// No new writers; waiting for in-flight writers to finish
    Draining,
    /// Writer count is zero; the mark is being taken
    Snapshotting,
}

#[derive(Debug)]
struct GateState {
    phase: SnapshotPhase,
    writers: u32,
}

/// Admission control between writers and the snapshot coordinator
#[derive(Debug)]
pub struct SnapshotGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for SnapshotGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                phase: SnapshotPhase::Idle,
                writers: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Admit a writer, waiting out any snapshot in progress
    pub fn enter_writer(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.phase != SnapshotPhase::Idle {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && state.phase != SnapshotPhase::Idle
            {
                return Err(FlashError::Busy("snapshot in progress".into()));
            }
        }
        state.writers += 1;
        Ok(())
    }

    /// Retire a writer; wakes a draining snapshot when the count hits zero
    pub fn exit_writer(&self) {
        let mut state = self.state.lock();
        if state.writers == 0 {
            fatal("writer count underflow");
        }
        state.writers -= 1;
        if state.writers == 0 && state.phase == SnapshotPhase::Draining {
            self.cond.notify_all();
        }
    }

    /// Stop admitting writers and wait for the in-flight ones to finish
    ///
    /// On success the gate is in `Snapshotting` until the returned guard is
    /// dropped. On timeout the gate is reopened and `Busy` is returned.
    pub fn begin_drain(&self, timeout: Duration) -> Result<DrainGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.phase != SnapshotPhase::Idle {
            // Callers serialize on the container's snapshot lock
            fatal(format!("snapshot drain started in phase {:?}", state.phase));
        }
        state.phase = SnapshotPhase::Draining;
        while state.writers > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out() && state.writers > 0 {
                state.phase = SnapshotPhase::Idle;
                self.cond.notify_all();
                return Err(FlashError::Busy(format!(
                    "{} writers still active after {:?}",
                    state.writers, timeout
                )));
            }
        }
        state.phase = SnapshotPhase::Snapshotting;
        Ok(DrainGuard { gate: self })
    }

    /// Current phase
    pub fn phase(&self) -> SnapshotPhase {
        self.state.lock().phase
    }

    /// Writers currently admitted
    pub fn writers(&self) -> u32 {
        self.state.lock().writers
    }

    fn reopen(&self) {
        let mut state = self.state.lock();
        state.phase = SnapshotPhase::Idle;
        self.cond.notify_all();
    }
}

/// Holds the gate closed to writers; reopens it on drop, error paths included
#[derive(Debug)]
#[must_use = "dropping the guard immediately readmits writers"]
pub struct DrainGuard<'a> {
    gate: &'a SnapshotGate,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.gate.reopen();
    }
}
