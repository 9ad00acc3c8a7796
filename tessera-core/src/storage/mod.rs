//! Storage engine - per storage group processors and their registry

mod bufferwrite;
mod filenode;
mod manager;
mod merge;
mod overflow;
mod processor;
mod resource;

pub use bufferwrite::BufferWriteProcessor;
pub use filenode::{FileNodeProcessor, FileNodeStats};
pub use manager::{EngineStats, FileNodeManager, ManagerStatus};
pub use overflow::{OverflowProcessor, PendingUpdate};
pub use processor::{FlushListener, InsertType, Processor};
pub use resource::TsFileResource;

use crate::config::EngineConfig;
use crate::memcontrol::MemController;
use crate::pool::WorkerPool;
use crate::tsfile::TsFileConfig;
use crate::wal::WalConfig;
use crate::{Result, TesseraError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Handles shared by every processor of one engine
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub mem: Arc<MemController>,
    pub flush_pool: Arc<WorkerPool>,
    pub merge_pool: Arc<WorkerPool>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mem = MemController::new(config.mem_warning_threshold, config.mem_dangerous_threshold);
        let flush_pool = WorkerPool::new("flush", config.concurrent_flush_threads)?;
        let merge_pool = WorkerPool::new("merge", config.concurrent_merge_threads)?;
        Ok(Self {
            config: Arc::new(config),
            mem: Arc::new(mem),
            flush_pool: Arc::new(flush_pool),
            merge_pool: Arc::new(merge_pool),
        })
    }

    pub fn tsfile_config(&self) -> TsFileConfig {
        TsFileConfig {
            compression: self.config.chunk_compression,
        }
    }

    /// Configuration of one log node
    pub fn wal_config(&self, node: &str) -> WalConfig {
        WalConfig {
            dir: self.config.wal_dir(node),
            sync_policy: self.config.wal.sync_policy,
            segment_size: self.config.wal.segment_size,
        }
    }
}

/// Replace a metadata store: payload and CRC32 go to a temp file that is
/// renamed over the old store
pub(crate) fn write_store<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = bincode::serialize(value)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a metadata store, `None` if it was never written
pub(crate) fn read_store<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    if data.len() < 4 {
        return Err(TesseraError::Corruption(format!("store {:?} is truncated", path)));
    }
    let (payload, trailer) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(TesseraError::ChecksumMismatch { expected, actual });
    }
    Ok(Some(bincode::deserialize(payload)?))
}

/// Name of a new data file: creation time and version
pub(crate) fn data_file_name(version: u64) -> String {
    format!(
        "{}-{}.{}",
        chrono::Utc::now().timestamp_millis(),
        version,
        crate::tsfile::TSFILE_SUFFIX
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_round_trip_and_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("system").join("filenode.store");
        assert_eq!(read_store::<Vec<u64>>(&path).unwrap(), None);

        write_store(&path, &vec![1u64, 2, 3]).unwrap();
        write_store(&path, &vec![4u64]).unwrap();
        assert_eq!(read_store::<Vec<u64>>(&path).unwrap(), Some(vec![4]));
        assert!(!path.with_extension("tmp").exists());

        let mut data = fs::read(&path).unwrap();
        data[0] ^= 0xff;
        fs::write(&path, data).unwrap();
        assert!(matches!(
            read_store::<Vec<u64>>(&path),
            Err(TesseraError::ChecksumMismatch { .. })
        ));
    }
}
