//! Engine configuration
//!
//! Loaded from a TOML file; every key is optional and falls back to the
//! defaults below.

use crate::wal::SyncPolicy;
use crate::{Result, TesseraError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Memtable size that triggers a buffer-write flush (64MB)
pub const MEMTABLE_SIZE_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Open file size (disk + memory) that triggers rollover (512MB)
pub const BUFFERWRITE_FILE_SIZE_THRESHOLD: u64 = 512 * 1024 * 1024;

/// WAL segment size (16MB)
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// WAL settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalSettings {
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::default(),
            segment_size: WAL_SEGMENT_SIZE,
        }
    }
}

/// Storage engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root data directory
    pub data_dir: PathBuf,
    /// Storage groups registered in the catalog at startup
    pub storage_groups: Vec<String>,
    /// Buffer-write memtable flush threshold in bytes
    pub memtable_size_threshold: u64,
    /// Rollover threshold for the open file in bytes
    pub bufferwrite_file_size_threshold: u64,
    /// Overflow memtable flush threshold in bytes
    pub overflow_memtable_size_threshold: u64,
    /// Write-ahead logging on/off
    pub enable_wal: bool,
    pub wal: WalSettings,
    /// Flush pool size
    pub concurrent_flush_threads: usize,
    /// Merge pool size
    pub concurrent_merge_threads: usize,
    /// Total memtable bytes at which writes start forcing flushes
    pub mem_warning_threshold: u64,
    /// Total memtable bytes at which writes are rejected
    pub mem_dangerous_threshold: u64,
    /// LZ4-compress chunks
    pub chunk_compression: bool,
    /// Sleep between attempts to lock a storage group for close/delete
    pub close_retry_interval_ms: u64,
    /// Attempts before close/delete gives up with a busy error
    pub close_max_attempts: u32,
    /// First merge completion poll interval
    pub merge_poll_initial_ms: u64,
    /// Poll interval cap
    pub merge_poll_max_ms: u64,
    /// Memory monitor period of the daemon
    pub mem_monitor_interval_ms: u64,
    /// Periodic merge period of the daemon, 0 disables
    pub merge_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            data_dir: PathBuf::from("data"),
            storage_groups: Vec::new(),
            memtable_size_threshold: MEMTABLE_SIZE_THRESHOLD,
            bufferwrite_file_size_threshold: BUFFERWRITE_FILE_SIZE_THRESHOLD,
            overflow_memtable_size_threshold: MEMTABLE_SIZE_THRESHOLD,
            enable_wal: true,
            wal: WalSettings::default(),
            concurrent_flush_threads: threads,
            concurrent_merge_threads: 2,
            mem_warning_threshold: 1024 * 1024 * 1024,
            mem_dangerous_threshold: 2 * 1024 * 1024 * 1024,
            chunk_compression: true,
            close_retry_interval_ms: 100,
            close_max_attempts: 50,
            merge_poll_initial_ms: 2_000,
            merge_poll_max_ms: 60_000,
            mem_monitor_interval_ms: 1_000,
            merge_interval_secs: 0,
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `data_dir` with default settings
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| TesseraError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.concurrent_flush_threads == 0 || self.concurrent_merge_threads == 0 {
            return Err(TesseraError::Config(
                "pool sizes must be at least 1".into(),
            ));
        }
        if self.mem_warning_threshold >= self.mem_dangerous_threshold {
            return Err(TesseraError::Config(format!(
                "mem_warning_threshold {} must be below mem_dangerous_threshold {}",
                self.mem_warning_threshold, self.mem_dangerous_threshold
            )));
        }
        if self.memtable_size_threshold == 0 || self.bufferwrite_file_size_threshold == 0 {
            return Err(TesseraError::Config("size thresholds must be positive".into()));
        }
        if self.merge_poll_initial_ms == 0 || self.merge_poll_initial_ms > self.merge_poll_max_ms {
            return Err(TesseraError::Config(
                "merge poll interval must be positive and below its cap".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the sealed and open sequence files of a group
    pub fn sequence_dir(&self, storage_group: &str) -> PathBuf {
        self.data_dir.join("sequence").join(storage_group)
    }

    /// Directory holding the overflow files of a group
    pub fn overflow_dir(&self, storage_group: &str) -> PathBuf {
        self.data_dir.join("overflow").join(storage_group)
    }

    /// Directory holding metadata stores and version files of a group
    pub fn system_dir(&self, storage_group: &str) -> PathBuf {
        self.data_dir.join("system").join(storage_group)
    }

    /// Directory of one WAL node
    pub fn wal_dir(&self, node: &str) -> PathBuf {
        self.data_dir.join("wal").join(node)
    }

    pub fn close_retry_interval(&self) -> Duration {
        Duration::from_millis(self.close_retry_interval_ms)
    }

    pub fn merge_poll_initial(&self) -> Duration {
        Duration::from_millis(self.merge_poll_initial_ms)
    }

    pub fn merge_poll_max(&self) -> Duration {
        Duration::from_millis(self.merge_poll_max_ms)
    }
}
