//! Out-of-order write path
//!
//! Points older than the flushed high-water-mark of their device land in a
//! single memtable. A flush is synchronous: the memtable becomes one sealed
//! overflow file listed in `overflow.store`. Overflow data shadows sequence
//! data on reads until a merge folds it into the sequence files.

use super::processor::Processor;
use super::{data_file_name, read_store, write_store, EngineContext, TsFileResource};
use crate::memcontrol::{MemController, UsageLevel};
use crate::memtable::{MemTable, ReadOnlyMemChunk};
use crate::modification::Deletion;
use crate::pool::TaskFuture;
use crate::query::OverflowSeriesDataSource;
use crate::tsfile::{TsFileConfig, TsFileWriter, TSFILE_SUFFIX};
use crate::version::VersionController;
use crate::wal::WriteLogNode;
use crate::{Result, SeriesPath, TesseraError, Timestamp, TsRecord, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const STORE_FILE: &str = "overflow.store";

#[derive(Debug, Default, Serialize, Deserialize)]
struct OverflowStore {
    files: Vec<TsFileResource>,
}

/// Points of an update whose memory is held but not yet buffered
#[derive(Debug)]
pub struct PendingUpdate {
    records: Vec<TsRecord>,
    level: UsageLevel,
}

impl PendingUpdate {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn update_records(
    device: &str,
    measurement: &str,
    timestamps: &[Timestamp],
    value: &Value,
) -> Vec<TsRecord> {
    timestamps
        .iter()
        .map(|&t| TsRecord::new(device, t).with_point(measurement, value.clone()))
        .collect()
}

/// Overflow processor of one storage group
pub struct OverflowProcessor {
    name: String,
    dir: PathBuf,
    store_path: PathBuf,
    work: MemTable,
    files: Vec<TsFileResource>,
    mem_size: u64,
    mem_threshold: u64,
    tsfile_config: TsFileConfig,
    version: Arc<dyn VersionController>,
    mem: Arc<MemController>,
    wal: Option<Arc<WriteLogNode>>,
    // files handed to a running merge, a prefix of `files`
    merging: Option<usize>,
    closed: bool,
}

impl OverflowProcessor {
    pub fn open(
        storage_group: &str,
        ctx: &EngineContext,
        version: Arc<dyn VersionController>,
        wal: Option<Arc<WriteLogNode>>,
    ) -> Result<Self> {
        let dir = ctx.config.overflow_dir(storage_group);
        fs::create_dir_all(&dir)?;
        let store_path = ctx.config.system_dir(storage_group).join(STORE_FILE);
        let store: OverflowStore = read_store(&store_path)?.unwrap_or_default();

        let mut files = Vec::with_capacity(store.files.len());
        for file in store.files {
            if file.path.exists() {
                files.push(file);
            } else {
                warn!("Overflow file {:?} listed but missing", file.path);
            }
        }
        remove_unlisted_files(&dir, &files)?;
        debug!(
            "Opened overflow processor of {} with {} files",
            storage_group,
            files.len()
        );

        Ok(Self {
            name: format!("{}-overflow", storage_group),
            dir,
            store_path,
            work: MemTable::new(),
            files,
            mem_size: 0,
            mem_threshold: ctx.config.overflow_memtable_size_threshold,
            tsfile_config: ctx.tsfile_config(),
            version,
            mem: ctx.mem.clone(),
            wal,
            merging: None,
            closed: false,
        })
    }

    /// Sealed overflow files, oldest first
    pub fn files(&self) -> &[TsFileResource] {
        &self.files
    }

    pub fn value_count(&self) -> usize {
        self.work.value_count()
    }

    /// True if the memtable or any file holds data not yet merged
    pub fn has_unmerged_data(&self) -> bool {
        !self.work.is_empty() || self.files.len() > self.merging.unwrap_or(0)
    }

    /// Buffer an out-of-order record, flushing past the memtable threshold
    pub fn insert(&mut self, record: &TsRecord) -> Result<()> {
        let level = self.reserve(record)?;
        self.insert_reserved(record, level)
    }

    /// Hold the memory of `record` ahead of its insert; rejected when
    /// memory is dangerously full
    pub fn reserve(&self, record: &TsRecord) -> Result<UsageLevel> {
        if self.closed {
            return Err(TesseraError::Closed(self.name.clone()));
        }
        let level = self.mem.acquire_usage(&self.name, record.estimated_size());
        if level == UsageLevel::Dangerous {
            return Err(TesseraError::Rejected(format!(
                "{} write of {} at {}",
                self.name, record.device, record.timestamp
            )));
        }
        Ok(level)
    }

    pub fn cancel(&self, record: &TsRecord) {
        self.mem.release_usage(&self.name, record.estimated_size());
    }

    /// Buffer a record whose memory was reserved at `level`
    pub fn insert_reserved(&mut self, record: &TsRecord, level: UsageLevel) -> Result<()> {
        self.buffer(record)?;
        self.flush_if_due(level);
        Ok(())
    }

    fn buffer(&mut self, record: &TsRecord) -> Result<()> {
        let bytes = record.estimated_size();
        if self.closed {
            self.mem.release_usage(&self.name, bytes);
            return Err(TesseraError::Closed(self.name.clone()));
        }
        if let Err(e) = self.work.write(record) {
            self.mem.release_usage(&self.name, bytes);
            return Err(e);
        }
        self.mem_size += bytes;
        Ok(())
    }

    fn flush_if_due(&mut self, level: UsageLevel) {
        if level == UsageLevel::Warning || self.mem_size > self.mem_threshold {
            // the points stay buffered when the flush fails
            if let Err(e) = self.flush_sync() {
                error!("Flush of {} after insert failed: {}", self.name, e);
            }
        }
    }

    /// Re-apply a logged record during recovery
    pub fn replay(&mut self, record: &TsRecord) -> Result<()> {
        self.work.write(record)?;
        let bytes = record.estimated_size();
        self.mem.acquire_usage(&self.name, bytes);
        self.mem_size += bytes;
        Ok(())
    }

    /// Overwrite the points at `timestamps` with `value`
    pub fn update(
        &mut self,
        device: &str,
        measurement: &str,
        timestamps: &[Timestamp],
        value: &Value,
    ) -> Result<()> {
        let pending = self.reserve_update(device, measurement, timestamps, value)?;
        self.apply_update(pending)
    }

    /// Reserve the memory of every point an update writes, all or nothing
    pub fn reserve_update(
        &self,
        device: &str,
        measurement: &str,
        timestamps: &[Timestamp],
        value: &Value,
    ) -> Result<PendingUpdate> {
        let records = update_records(device, measurement, timestamps, value);
        let mut level = UsageLevel::Safe;
        for (reserved, record) in records.iter().enumerate() {
            match self.reserve(record) {
                Ok(next) => level = level.max(next),
                Err(e) => {
                    records[..reserved].iter().for_each(|r| self.cancel(r));
                    return Err(e);
                }
            }
        }
        Ok(PendingUpdate { records, level })
    }

    pub fn cancel_update(&self, pending: PendingUpdate) {
        pending.records.iter().for_each(|r| self.cancel(r));
    }

    /// Buffer the points of a reserved update, flushing at most once
    pub fn apply_update(&mut self, pending: PendingUpdate) -> Result<()> {
        for (applied, record) in pending.records.iter().enumerate() {
            if let Err(e) = self.buffer(record) {
                pending.records[applied + 1..]
                    .iter()
                    .for_each(|r| self.cancel(r));
                return Err(e);
            }
        }
        self.flush_if_due(pending.level);
        Ok(())
    }

    /// Re-apply a logged update during recovery
    pub fn replay_update(
        &mut self,
        device: &str,
        measurement: &str,
        timestamps: &[Timestamp],
        value: &Value,
    ) -> Result<()> {
        for record in update_records(device, measurement, timestamps, value) {
            self.replay(&record)?;
        }
        Ok(())
    }

    /// Memtable view and files of one series
    pub fn query(&self, device: &str, measurement: &str) -> OverflowSeriesDataSource {
        let mem = self
            .work
            .query(device, measurement)
            .map(|series| ReadOnlyMemChunk::new(series.data_type, vec![series.points]))
            .filter(|chunk| !chunk.is_empty());
        OverflowSeriesDataSource {
            path: SeriesPath::new(device, measurement),
            files: self
                .files
                .iter()
                .filter(|f| f.contains_device(device))
                .cloned()
                .collect(),
            mem,
        }
    }

    /// Drop buffered points at or before `timestamp` and record a tombstone
    /// on every file that may hold older points of the series
    pub fn delete(
        &mut self,
        device: &str,
        measurement: &str,
        timestamp: Timestamp,
        version: u64,
    ) -> Result<usize> {
        let removed = self.work.delete(device, measurement, timestamp);
        let path = SeriesPath::new(device, measurement);
        for file in &self.files {
            if file.start_time(device).is_some_and(|start| start <= timestamp) {
                file.modification_file()
                    .write(&Deletion::new(path.clone(), version, timestamp))?;
            }
        }
        Ok(removed)
    }

    /// Memtable half of a delete, for replay; file tombstones are already durable
    pub fn delete_buffered(&mut self, device: &str, measurement: &str, timestamp: Timestamp) -> usize {
        self.work.delete(device, measurement, timestamp)
    }

    /// Flush the memtable into a new sealed file
    pub fn flush_sync(&mut self) -> Result<()> {
        if self.work.is_empty() {
            return Ok(());
        }
        if let Some(wal) = &self.wal {
            wal.notify_start_flush()?;
        }
        let result = self.write_file().and_then(|resource| self.publish(resource));
        if let Some(wal) = &self.wal {
            if let Err(e) = wal.notify_end_flush(result.is_ok()) {
                warn!("Log node of {} not notified: {}", self.name, e);
            }
        }
        result?;

        self.work.clear();
        self.mem.release_usage(&self.name, self.mem_size);
        self.mem_size = 0;
        Ok(())
    }

    fn publish(&mut self, resource: TsFileResource) -> Result<()> {
        info!(
            "Flushed {} overflow points of {} to {:?}",
            self.work.value_count(),
            self.name,
            resource.path
        );
        self.files.push(resource);
        if let Err(e) = self.persist() {
            // durable but unlisted: removed as an orphan on restart
            self.files.pop();
            return Err(e);
        }
        Ok(())
    }

    fn write_file(&self) -> Result<TsFileResource> {
        let version = self.version.next_version()?;
        let path = self.dir.join(data_file_name(version));
        let mut resource = TsFileResource::new(&path);

        let result = (|| -> Result<()> {
            let mut writer = TsFileWriter::open(&path, self.tsfile_config.clone())?;
            for (device, series) in self.work.snapshot() {
                let group = writer.write_chunk_group(&device, version, series)?;
                if let (Some(start), Some(end)) = (group.start_time(), group.end_time()) {
                    resource.update_start_time(&device, start);
                    resource.update_end_time(&device, end);
                }
            }
            writer.end_file()
        })();

        if let Err(e) = result {
            if let Err(cleanup) = resource.remove() {
                warn!("Cannot remove failed overflow file {:?}: {}", path, cleanup);
            }
            return Err(e);
        }
        Ok(resource)
    }

    fn persist(&self) -> Result<()> {
        write_store(
            &self.store_path,
            &OverflowStore {
                files: self.files.clone(),
            },
        )
    }

    /// Flush and hand every current file to a merge
    pub fn merge_snapshot(&mut self) -> Result<Vec<TsFileResource>> {
        if self.merging.is_some() {
            return Err(TesseraError::InvalidState(format!(
                "{} is already merging",
                self.name
            )));
        }
        self.flush_sync()?;
        self.merging = Some(self.files.len());
        Ok(self.files.clone())
    }

    /// End a merge. On success the merged files leave the list and are
    /// returned for removal; on failure they stay.
    pub fn finish_merge(&mut self, success: bool) -> Result<Vec<TsFileResource>> {
        let Some(count) = self.merging.take() else {
            return Ok(Vec::new());
        };
        if !success {
            return Ok(Vec::new());
        }
        let merged: Vec<TsFileResource> = self.files.drain(..count).collect();
        self.persist()?;
        Ok(merged)
    }

    pub fn is_merging(&self) -> bool {
        self.merging.is_some()
    }
}

impl Processor for OverflowProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn flush(&mut self) -> Result<TaskFuture<()>> {
        if self.closed {
            return Err(TesseraError::Closed(self.name.clone()));
        }
        self.flush_sync()?;
        Ok(TaskFuture::ready(()))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_sync()?;
        self.closed = true;
        info!("Closed {}", self.name);
        Ok(())
    }

    fn memory_usage(&self) -> u64 {
        self.mem_size
    }

    fn can_be_closed(&self) -> bool {
        self.merging.is_none()
    }
}

/// Remove data files of the directory that the store does not list
pub(super) fn remove_unlisted_files(dir: &Path, listed: &[TsFileResource]) -> Result<()> {
    let keep: HashSet<&Path> = listed.iter().map(|f| f.path.as_path()).collect();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_data = path.extension().is_some_and(|e| e == TSFILE_SUFFIX);
        if is_data && !keep.contains(path.as_path()) {
            warn!("Removing unlisted data file {:?}", path);
            TsFileResource::new(&path).remove()?;
        }
    }
    Ok(())
}
