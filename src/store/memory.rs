//! In-memory object store
//!
//! Used by tests and benches, and anywhere persistence across processes is
//! not required. A `MemoryStore` shared through `Arc` survives an engine
//! restart, which is how crash scenarios are simulated. Writes and deletes
//! can be made to fail per container to exercise error paths.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::{FlashError, Result};
use crate::types::ContainerId;

use super::{ObjectKind, ObjectStore, SyncMode, WriteMode};

#[derive(Default)]
struct Namespace {
    typed: BTreeMap<Vec<u8>, Bytes>,
    raw: BTreeMap<Vec<u8>, Bytes>,
}

impl Namespace {
    fn objects(&self, kind: ObjectKind) -> &BTreeMap<Vec<u8>, Bytes> {
        match kind {
            ObjectKind::Typed => &self.typed,
            ObjectKind::Raw => &self.raw,
        }
    }

    fn objects_mut(&mut self, kind: ObjectKind) -> &mut BTreeMap<Vec<u8>, Bytes> {
        match kind {
            ObjectKind::Typed => &mut self.typed,
            ObjectKind::Raw => &mut self.raw,
        }
    }
}

/// Object store backed by ordered maps
#[derive(Default)]
pub struct MemoryStore {
    containers: RwLock<HashMap<ContainerId, Namespace>>,
    software_syncs: AtomicU64,
    hardware_syncs: AtomicU64,
    /// Remaining injected failures per container
    write_faults: Mutex<HashMap<ContainerId, u64>>,
    delete_faults: Mutex<HashMap<ContainerId, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored for a container (both kinds)
    pub fn object_count(&self, cid: ContainerId) -> usize {
        self.containers
            .read()
            .get(&cid)
            .map(|ns| ns.typed.len() + ns.raw.len())
            .unwrap_or(0)
    }

    /// Writes acknowledged with the given sync level so far
    pub fn sync_count(&self, mode: SyncMode) -> u64 {
        match mode {
            SyncMode::None => 0,
            SyncMode::Software => self.software_syncs.load(Ordering::Relaxed),
            SyncMode::Hardware => self.hardware_syncs.load(Ordering::Relaxed),
        }
    }

    /// Fail the next `count` writes to `cid` with an I/O error
    pub fn fail_writes(&self, cid: ContainerId, count: u64) {
        self.write_faults.lock().insert(cid, count);
    }

    /// Fail the next `count` deletes in `cid` with an I/O error
    pub fn fail_deletes(&self, cid: ContainerId, count: u64) {
        self.delete_faults.lock().insert(cid, count);
    }

    fn inject(faults: &Mutex<HashMap<ContainerId, u64>>, cid: ContainerId, op: &str) -> Result<()> {
        let mut faults = faults.lock();
        match faults.get_mut(&cid) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(FlashError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected {} failure in container {}", op, cid),
                )))
            }
            _ => Ok(()),
        }
    }

    fn record_sync(&self, mode: SyncMode) {
        match mode {
            SyncMode::None => {}
            SyncMode::Software => {
                self.software_syncs.fetch_add(1, Ordering::Relaxed);
            }
            SyncMode::Hardware => {
                self.hardware_syncs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl ObjectStore for MemoryStore {
    fn read(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<Bytes> {
        self.containers
            .read()
            .get(&cid)
            .and_then(|ns| ns.objects(kind).get(key).cloned())
            .ok_or(FlashError::ObjectNotFound)
    }

    fn write(
        &self,
        cid: ContainerId,
        kind: ObjectKind,
        key: &[u8],
        data: &[u8],
        mode: WriteMode,
        sync: SyncMode,
    ) -> Result<()> {
        Self::inject(&self.write_faults, cid, "write")?;
        {
            let mut containers = self.containers.write();
            let objects = containers.entry(cid).or_default().objects_mut(kind);
            if mode == WriteMode::Create && objects.contains_key(key) {
                return Err(FlashError::ObjectExists);
            }
            objects.insert(key.to_vec(), Bytes::copy_from_slice(data));
        }
        self.record_sync(sync);
        Ok(())
    }

    fn delete(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<()> {
        Self::inject(&self.delete_faults, cid, "delete")?;
        let mut containers = self.containers.write();
        let ns = containers.get_mut(&cid).ok_or(FlashError::ObjectNotFound)?;
        ns.objects_mut(kind)
            .remove(key)
            .map(|_| ())
            .ok_or(FlashError::ObjectNotFound)?;
        if ns.typed.is_empty() && ns.raw.is_empty() {
            containers.remove(&cid);
        }
        Ok(())
    }

    fn flush(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<()> {
        if self.contains(cid, kind, key)? {
            Ok(())
        } else {
            Err(FlashError::ObjectNotFound)
        }
    }

    fn flush_container(&self, _cid: ContainerId) -> Result<()> {
        Ok(())
    }

    fn keys(&self, cid: ContainerId, kind: ObjectKind) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .containers
            .read()
            .get(&cid)
            .map(|ns| ns.objects(kind).keys().cloned().collect())
            .unwrap_or_default())
    }

    fn contains(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<bool> {
        Ok(self
            .containers
            .read()
            .get(&cid)
            .map(|ns| ns.objects(kind).contains_key(key))
            .unwrap_or(false))
    }
}
