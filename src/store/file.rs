//! File-backed object store
//!
//! One file per object:
//!
//! ```text
//! {root}/
//!   ├── c00001/
//!   │     ├── t-0000000000000000.obj   (typed object, hex key)
//!   │     └── r-00000000000000ff.obj   (raw object)
//!   └── c00003/...
//! ```
//!
//! Writes land in a temp file that is renamed over the target, so a reader
//! never sees a half-written object.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{FlashError, Result};
use crate::types::ContainerId;

use super::{ObjectKind, ObjectStore, SyncMode, WriteMode};

/// Magic bytes identifying a flashtree object file
const MAGIC: &[u8; 4] = b"FTOB";

/// Current object format version
const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + Len (4) + CRC (4) = 14 bytes
const HEADER_SIZE: usize = 14;

const OBJECT_EXT: &str = "obj";

/// File name limit on common filesystems
const MAX_FILE_NAME: usize = 255;

/// Longest key whose file name, temp suffix included, fits `MAX_FILE_NAME`:
/// "t-" + hex key + ".obj.tmp." + u64 counter
const MAX_KEY_LEN: usize = (MAX_FILE_NAME - 2 - ".obj.tmp.".len() - 20) / 2;

/// Object store keeping each object in its own checksummed file
pub struct FileStore {
    /// Root directory holding one subdirectory per container
    root: PathBuf,

    /// Serializes must-not-exist writes against each other
    create_lock: Mutex<()>,

    /// Unique suffix for temp files
    next_tmp: AtomicU64,
}

impl FileStore {
    /// Open or create a store rooted at `path`
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;

        // Temp files left by a crash mid-write are garbage
        for entry in fs::read_dir(path)? {
            let dir = entry?.path();
            if dir.is_dir() {
                for file in fs::read_dir(&dir)? {
                    let file = file?.path();
                    if Self::is_temp(&file) {
                        tracing::debug!(path = %file.display(), "removing stale temp object");
                        fs::remove_file(&file)?;
                    }
                }
            }
        }

        Ok(Self {
            root: path.to_path_buf(),
            create_lock: Mutex::new(()),
            next_tmp: AtomicU64::new(0),
        })
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn container_dir(&self, cid: ContainerId) -> PathBuf {
        self.root.join(format!("c{:05}", cid.as_u32()))
    }

    fn object_path(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<PathBuf> {
        if key.len() > MAX_KEY_LEN {
            return Err(FlashError::InvalidArgument(format!(
                "object key of {} bytes exceeds {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(self
            .container_dir(cid)
            .join(format!("{}-{}.{}", Self::kind_prefix(kind), encode_hex(key), OBJECT_EXT)))
    }

    fn kind_prefix(kind: ObjectKind) -> char {
        match kind {
            ObjectKind::Typed => 't',
            ObjectKind::Raw => 'r',
        }
    }

    fn is_temp(path: &Path) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy().contains(".tmp."))
            .unwrap_or(false)
    }

    /// "t-6b31.obj" → Some((Typed, b"k1"))
    fn parse_object_name(path: &Path) -> Option<(ObjectKind, Vec<u8>)> {
        if path.extension()? != OBJECT_EXT {
            return None;
        }
        let stem = path.file_stem()?.to_string_lossy();
        let (prefix, hex) = stem.split_once('-')?;
        let kind = match prefix {
            "t" => ObjectKind::Typed,
            "r" => ObjectKind::Raw,
            _ => return None,
        };
        Some((kind, decode_hex(hex)?))
    }

    fn encode_object(data: &[u8]) -> Result<Vec<u8>> {
        let len = u32::try_from(data.len())
            .map_err(|_| FlashError::InvalidArgument(format!("object too large: {} bytes", data.len())))?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
        buf.extend_from_slice(data);
        Ok(buf)
    }

    fn decode_object(path: &Path, buf: Vec<u8>) -> Result<Bytes> {
        if buf.len() < HEADER_SIZE || &buf[0..4] != MAGIC {
            return Err(FlashError::Corruption(format!(
                "bad object header in {}",
                path.display()
            )));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != VERSION {
            return Err(FlashError::Corruption(format!(
                "unsupported object version {} in {}",
                version,
                path.display()
            )));
        }
        let len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
        let crc = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        if buf.len() != HEADER_SIZE + len {
            return Err(FlashError::Corruption(format!(
                "object length mismatch in {}: header says {}, file has {}",
                path.display(),
                len,
                buf.len() - HEADER_SIZE
            )));
        }
        let payload = Bytes::from(buf).slice(HEADER_SIZE..);
        if crc32fast::hash(&payload) != crc {
            return Err(FlashError::Corruption(format!(
                "object checksum mismatch in {}",
                path.display()
            )));
        }
        Ok(payload)
    }

    fn sync_dir(dir: &Path) -> Result<()> {
        // Directory fsync makes the rename itself durable
        #[cfg(unix)]
        File::open(dir)?.sync_all()?;
        #[cfg(not(unix))]
        let _ = dir;
        Ok(())
    }

    fn write_file(&self, path: &Path, data: &[u8], sync: SyncMode) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| FlashError::InvalidArgument(format!("bad object path {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let tmp_id = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("{}.tmp.{}", OBJECT_EXT, tmp_id));

        let encoded = Self::encode_object(data)?;
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&encoded)?;
            if sync == SyncMode::Hardware {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp_path, path)?;
        if sync == SyncMode::Hardware {
            Self::sync_dir(dir)?;
        }
        Ok(())
    }
}

impl ObjectStore for FileStore {
    fn read(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<Bytes> {
        let path = self.object_path(cid, kind, key)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(FlashError::ObjectNotFound),
            Err(e) => return Err(e.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::decode_object(&path, buf)
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
        let path = self.object_path(cid, kind, key)?;
        match mode {
            WriteMode::Set => self.write_file(&path, data, sync),
            WriteMode::Create => {
                let _guard = self.create_lock.lock();
                if path.exists() {
                    return Err(FlashError::ObjectExists);
                }
                self.write_file(&path, data, sync)
            }
        }
    }

    fn delete(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<()> {
        let path = self.object_path(cid, kind, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FlashError::ObjectNotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<()> {
        let path = self.object_path(cid, kind, key)?;
        match File::open(&path) {
            Ok(file) => Ok(file.sync_all()?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FlashError::ObjectNotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn flush_container(&self, cid: ContainerId) -> Result<()> {
        let dir = self.container_dir(cid);
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if Self::parse_object_name(&path).is_some() {
                File::open(&path)?.sync_all()?;
            }
        }
        Self::sync_dir(&dir)
    }

    fn keys(&self, cid: ContainerId, kind: ObjectKind) -> Result<Vec<Vec<u8>>> {
        let dir = self.container_dir(cid);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some((found, key)) = Self::parse_object_name(&path) {
                if found == kind {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn contains(&self, cid: ContainerId, kind: ObjectKind, key: &[u8]) -> Result<bool> {
        Ok(self.object_path(cid, kind, key)?.exists())
    }

    fn max_key_len(&self) -> usize {
        MAX_KEY_LEN
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
