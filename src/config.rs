//! Configuration for flashtree
//!
//! Centralized configuration with sensible defaults. `Config` covers the
//! whole store; `ContainerConfig` is supplied per container at create time.

use std::path::PathBuf;

use crate::error::{FlashError, Result};
use crate::index::RootMeta;
use crate::types::{ContainerId, Durability, IndexMode};

/// Main configuration for a flashtree instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     └── objects/
    ///           ├── c00001/     (container metadata + stats)
    ///           ├── c00002/     (sequence ceiling)
    ///           └── c00003/...  (user containers)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Node Configuration
    // -------------------------------------------------------------------------
    /// Size of every non-overflow index node, in bytes
    pub node_size: usize,

    /// Values longer than this are stored as overflow nodes
    pub inline_threshold: usize,

    // -------------------------------------------------------------------------
    // Registry Configuration
    // -------------------------------------------------------------------------
    /// Number of control-block slots (identifier space, reserved ids included)
    pub max_containers: usize,

    /// Snapshots a single container may hold at once
    pub max_snapshots: usize,

    /// How long close/delete wait for outstanding I/O before reporting busy
    pub drain_timeout_ms: u64,

    /// How long a writer waits for a snapshot, and a snapshot for writers
    pub snapshot_wait_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Sequence Configuration
    // -------------------------------------------------------------------------
    /// Numbers handed to a calling context per reservation
    pub sequence_batch_size: u64,

    /// Distance the persisted ceiling advances each time it is bumped
    pub sequence_sync_interval: u64,

    // -------------------------------------------------------------------------
    // Background Work
    // -------------------------------------------------------------------------
    /// Threads processing asynchronous container deletes
    pub async_delete_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./flashtree_data"),
            node_size: 8192,
            inline_threshold: 2048,
            max_containers: 4096,
            max_snapshots: 16,
            drain_timeout_ms: 5000,
            snapshot_wait_timeout_ms: 10_000,
            sequence_batch_size: 10_000,
            sequence_sync_interval: 100_000_000_000,
            async_delete_workers: 1,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_size < 512 {
            return Err(FlashError::Config(format!(
                "node_size must be at least 512 bytes, got {}",
                self.node_size
            )));
        }
        if self.inline_threshold == 0 || self.inline_threshold >= self.node_size {
            return Err(FlashError::Config(format!(
                "inline_threshold must be in 1..{}, got {}",
                self.node_size, self.inline_threshold
            )));
        }
        if !RootMeta::fits(self.node_size, self.max_snapshots) {
            return Err(FlashError::Config(format!(
                "an index root with {} snapshots does not fit a {}-byte node",
                self.max_snapshots, self.node_size
            )));
        }
        let min_slots = ContainerId::FIRST_USER as usize + 1;
        if self.max_containers < min_slots || self.max_containers > ContainerId::MAX_CAPACITY {
            return Err(FlashError::Config(format!(
                "max_containers must be in {}..={}, got {}",
                min_slots,
                ContainerId::MAX_CAPACITY,
                self.max_containers
            )));
        }
        if self.sequence_batch_size == 0 {
            return Err(FlashError::Config("sequence_batch_size must be > 0".into()));
        }
        if self.sequence_sync_interval < self.sequence_batch_size {
            return Err(FlashError::Config(
                "sequence_sync_interval must be >= sequence_batch_size".into(),
            ));
        }
        if self.async_delete_workers == 0 {
            return Err(FlashError::Config("async_delete_workers must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the node size (in bytes)
    pub fn node_size(mut self, size: usize) -> Self {
        self.config.node_size = size;
        self
    }

    /// Set the inline value threshold (in bytes)
    pub fn inline_threshold(mut self, size: usize) -> Self {
        self.config.inline_threshold = size;
        self
    }

    /// Set the number of control-block slots
    pub fn max_containers(mut self, count: usize) -> Self {
        self.config.max_containers = count;
        self
    }

    /// Set the per-container snapshot limit
    pub fn max_snapshots(mut self, count: usize) -> Self {
        self.config.max_snapshots = count;
        self
    }

    /// Set the close/delete drain timeout (in milliseconds)
    pub fn drain_timeout_ms(mut self, ms: u64) -> Self {
        self.config.drain_timeout_ms = ms;
        self
    }

    /// Set the snapshot/writer wait timeout (in milliseconds)
    pub fn snapshot_wait_timeout_ms(mut self, ms: u64) -> Self {
        self.config.snapshot_wait_timeout_ms = ms;
        self
    }

    /// Set the sequence reservation block size
    pub fn sequence_batch_size(mut self, size: u64) -> Self {
        self.config.sequence_batch_size = size;
        self
    }

    /// Set the persisted-ceiling advance step
    pub fn sequence_sync_interval(mut self, interval: u64) -> Self {
        self.config.sequence_sync_interval = interval;
        self
    }

    /// Set the number of async delete worker threads
    pub fn async_delete_workers(mut self, count: usize) -> Self {
        self.config.async_delete_workers = count;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Settings chosen when a container is created
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Maximum bytes of user data; 0 means unlimited
    pub size_limit: u64,

    /// Crash-safety level applied to every write
    pub durability: Durability,

    /// Ordered index or flat object mode
    pub mode: IndexMode,

    /// Reject writes
    pub read_only: bool,

    /// Compress nodes before they reach the object store
    pub compression: bool,
}

impl ContainerConfig {
    /// Create a new container config builder
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::default()
    }
}

/// Builder for ContainerConfig
#[derive(Default)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    /// Set the size limit (in bytes, 0 = unlimited)
    pub fn size_limit(mut self, bytes: u64) -> Self {
        self.config.size_limit = bytes;
        self
    }

    /// Set the durability level
    pub fn durability(mut self, durability: Durability) -> Self {
        self.config.durability = durability;
        self
    }

    /// Set the index mode
    pub fn mode(mut self, mode: IndexMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Mark the container read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Enable node compression
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    pub fn build(self) -> ContainerConfig {
        self.config
    }
}
