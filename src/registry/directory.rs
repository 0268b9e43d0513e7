//! Name directory
//!
//! name → identifier map, locked separately from the control blocks. Every
//! mutation happens inside the registry's container-operation section so the
//! map and the control block's name field change together.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{FlashError, Result};
use crate::types::ContainerId;

/// Directory entry: the identifier and where its metadata record lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: ContainerId,
    pub meta_key: Vec<u8>,
}

#[derive(Default)]
pub struct NameDirectory {
    entries: RwLock<HashMap<String, DirectoryEntry>>,
}

impl NameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<DirectoryEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn insert(&self, name: &str, entry: DirectoryEntry) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(FlashError::ContainerExists(name.to_string()));
        }
        entries.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<DirectoryEntry> {
        self.entries.write().remove(name)
    }

    /// Move an entry to a new name in one step
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(new) {
            return Err(FlashError::ContainerExists(new.to_string()));
        }
        let entry = entries
            .remove(old)
            .ok_or_else(|| FlashError::ContainerNotFound(old.to_string()))?;
        entries.insert(new.to_string(), entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
