//! Scoped handles into the registry
//!
//! `ContainerRef` pins a control block (reference count), `IoGuard` pins an
//! I/O slot (reader or writer count). Both undo their increment on drop, so
//! every exit path, error paths included, releases exactly once.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{fatal, FlashError, Result};
use crate::lifecycle::{ContainerHandle, ContainerState};
use crate::types::ContainerId;

use super::{ControlBlock, Registry};

/// Kind of I/O a caller is about to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

/// A counted reference to a registered container
pub struct ContainerRef<'a> {
    pub(super) registry: &'a Registry,
    pub(super) id: ContainerId,
    pub(super) generation: u64,
}

impl<'a> ContainerRef<'a> {
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Generation of the slot when this reference was taken
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn block(&self) -> &'a ControlBlock {
        self.registry.block(self.id)
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// False once the identifier has been recycled for another container
    pub fn is_current(&self) -> bool {
        self.block().generation() == self.generation
    }

    pub fn state(&self) -> ContainerState {
        self.block().state()
    }

    pub fn name(&self) -> String {
        self.block().name()
    }

    /// Enter an I/O section; see [`Registry::begin_io`]
    pub fn begin_io(&self, mode: IoMode) -> Result<IoGuard<'a>> {
        self.registry.begin_io(self, mode)
    }

    /// The attached handle of an open container
    pub fn handle(&self) -> Result<Arc<ContainerHandle>> {
        if !self.is_current() {
            return Err(FlashError::ContainerNotFound(self.id.to_string()));
        }
        self.block().handle().ok_or_else(|| {
            FlashError::InvalidContainerState(format!(
                "container {} is {}, not open",
                self.id,
                self.state()
            ))
        })
    }

    /// Give the reference back explicitly
    pub fn release(self) {
        drop(self)
    }
}

impl fmt::Debug for ContainerRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRef")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for ContainerRef<'_> {
    fn drop(&mut self) {
        let block = self.registry.block(self.id);
        let prev = block.refs.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            fatal(format!("double release of container {}", self.id));
        }
        self.registry.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An admitted reader or writer; `end_io` runs on drop
#[must_use = "dropping the guard ends the I/O section"]
pub struct IoGuard<'a> {
    pub(super) block: &'a ControlBlock,
    pub(super) mode: IoMode,
}

impl IoGuard<'_> {
    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn container(&self) -> ContainerId {
        self.block.id()
    }
}

impl fmt::Debug for IoGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoGuard")
            .field("container", &self.block.id())
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        match self.mode {
            IoMode::Read => {
                let prev = self.block.readers.fetch_sub(1, Ordering::SeqCst);
                if prev == 0 {
                    fatal(format!("reader count underflow on container {}", self.block.id()));
                }
            }
            IoMode::Write => self.block.gate.exit_writer(),
        }
    }
}
