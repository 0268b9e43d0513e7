//! Persisted container metadata
//!
//! One record per container, plus its stats, stored as typed objects in the
//! metadata container (`ContainerId::METADATA`).
//!
//! ## Keys
//! ```text
//! "meta:"  + container id (u32 BE)   →  ContainerMeta (bincode)
//! "stats:" + container id (u32 BE)   →  StatsRecord   (bincode)
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;
use crate::error::{FlashError, Result};
use crate::stats::StatsRecord;
use crate::store::{ObjectKind, ObjectStore, SyncMode, WriteMode};
use crate::types::{ContainerId, Durability, IndexMode};

const META_PREFIX: &[u8] = b"meta:";
const STATS_PREFIX: &[u8] = b"stats:";

/// Everything needed to re-register a container after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub id: ContainerId,
    pub name: String,
    pub size_limit: u64,
    pub durability: Durability,
    pub mode: IndexMode,
    pub read_only: bool,
    pub compression: bool,
    /// Set durably before any object of the container is removed
    pub delete_in_progress: bool,
    /// Name before an asynchronous delete hid the container
    pub original_name: Option<String>,
}

impl ContainerMeta {
    pub fn new(id: ContainerId, name: &str, config: &ContainerConfig) -> Self {
        Self {
            id,
            name: name.to_string(),
            size_limit: config.size_limit,
            durability: config.durability,
            mode: config.mode,
            read_only: config.read_only,
            compression: config.compression,
            delete_in_progress: false,
            original_name: None,
        }
    }
}

/// Reads and writes metadata records in the metadata container
pub struct MetaStore {
    store: Arc<dyn ObjectStore>,
}

impl MetaStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn key(prefix: &[u8], id: ContainerId) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + 4);
        key.extend_from_slice(prefix);
        key.extend_from_slice(&id.as_u32().to_be_bytes());
        key
    }

    /// Key of a container's metadata record
    pub fn meta_key(id: ContainerId) -> Vec<u8> {
        Self::key(META_PREFIX, id)
    }

    pub fn stats_key(id: ContainerId) -> Vec<u8> {
        Self::key(STATS_PREFIX, id)
    }

    pub fn load(&self, id: ContainerId) -> Result<ContainerMeta> {
        let bytes = self
            .store
            .read(ContainerId::METADATA, ObjectKind::Typed, &Self::meta_key(id))
            .map_err(|e| match e {
                FlashError::ObjectNotFound => FlashError::ContainerNotFound(id.to_string()),
                other => other,
            })?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Persist a record; metadata always goes out hardware-synced
    pub fn save(&self, meta: &ContainerMeta) -> Result<()> {
        let bytes = bincode::serialize(meta)?;
        self.store.write(
            ContainerId::METADATA,
            ObjectKind::Typed,
            &Self::meta_key(meta.id),
            &bytes,
            WriteMode::Set,
            SyncMode::Hardware,
        )
    }

    /// Remove a record; a missing record is not an error
    pub fn remove(&self, id: ContainerId) -> Result<()> {
        ignore_missing(
            self.store
                .delete(ContainerId::METADATA, ObjectKind::Typed, &Self::meta_key(id)),
        )
    }

    /// Every persisted container record, in identifier order
    pub fn load_all(&self) -> Result<Vec<ContainerMeta>> {
        let mut metas = Vec::new();
        for key in self.store.keys(ContainerId::METADATA, ObjectKind::Typed)? {
            if !key.starts_with(META_PREFIX) {
                continue;
            }
            let bytes = self
                .store
                .read(ContainerId::METADATA, ObjectKind::Typed, &key)?;
            let meta: ContainerMeta = bincode::deserialize(&bytes).map_err(|e| {
                FlashError::Corruption(format!("undecodable container metadata: {}", e))
            })?;
            if Self::meta_key(meta.id) != key {
                return Err(FlashError::Corruption(format!(
                    "metadata record for container {} stored under a foreign key",
                    meta.id
                )));
            }
            metas.push(meta);
        }
        metas.sort_by_key(|m| m.id);
        Ok(metas)
    }

    /// Persisted stats, or zeroes if none were saved yet
    pub fn load_stats(&self, id: ContainerId) -> Result<StatsRecord> {
        match self
            .store
            .read(ContainerId::METADATA, ObjectKind::Typed, &Self::stats_key(id))
        {
            Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
            Err(FlashError::ObjectNotFound) => Ok(StatsRecord::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save_stats(&self, id: ContainerId, record: &StatsRecord) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        self.store.write(
            ContainerId::METADATA,
            ObjectKind::Typed,
            &Self::stats_key(id),
            &bytes,
            WriteMode::Set,
            SyncMode::Software,
        )
    }

    pub fn remove_stats(&self, id: ContainerId) -> Result<()> {
        ignore_missing(
            self.store
                .delete(ContainerId::METADATA, ObjectKind::Typed, &Self::stats_key(id)),
        )
    }
}

pub(crate) fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
