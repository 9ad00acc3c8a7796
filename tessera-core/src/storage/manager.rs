//! Registry of storage group processors
//!
//! Processors are built lazily on first use. Construction of one group
//! serializes on a lock of its own, so first writers to different groups
//! never wait on each other.

use super::filenode::{FileNodeProcessor, FileNodeStats};
use super::processor::InsertType;
use super::EngineContext;
use crate::catalog::MetadataCatalog;
use crate::memcontrol::UsageLevel;
use crate::pool::TaskFuture;
use crate::query::reader::read_all;
use crate::query::{Filter, QueryContext, QueryDataSource, SeriesReader};
use crate::{Result, TesseraError, TimeValuePair, Timestamp, TsRecord, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Manager-wide mode; merge and close exclude each other
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    None,
    Merge,
    Close,
}

#[derive(Default)]
struct Counters {
    total_points: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    successful_points: AtomicU64,
    failed_points: AtomicU64,
}

/// Snapshot of the whole engine
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub status: ManagerStatus,
    pub total_points: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub successful_points: u64,
    pub failed_points: u64,
    pub memory_usage: u64,
    pub storage_groups: Vec<FileNodeStats>,
}

pub struct FileNodeManager {
    ctx: EngineContext,
    catalog: Arc<dyn MetadataCatalog>,
    processors: RwLock<HashMap<String, Arc<FileNodeProcessor>>>,
    init_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    status: Mutex<ManagerStatus>,
    counters: Counters,
    next_job: AtomicU64,
}

impl FileNodeManager {
    pub fn new(ctx: EngineContext, catalog: Arc<dyn MetadataCatalog>) -> Self {
        Self {
            ctx,
            catalog,
            processors: RwLock::new(HashMap::new()),
            init_locks: Mutex::new(HashMap::new()),
            status: Mutex::new(ManagerStatus::None),
            counters: Counters::default(),
            next_job: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn status(&self) -> ManagerStatus {
        *self.status.lock()
    }

    /// Processor of the storage group owning a device or series path
    pub fn get_processor(&self, path: &str) -> Result<Arc<FileNodeProcessor>> {
        let name = self.catalog.storage_group_of(path)?;
        self.processor(&name)
    }

    fn processor(&self, name: &str) -> Result<Arc<FileNodeProcessor>> {
        if let Some(processor) = self.processors.read().get(name) {
            return Ok(processor.clone());
        }
        let init_lock = self.init_lock(name);
        let _guard = init_lock.lock();
        self.construct(name)
    }

    fn init_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.init_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    // caller holds the init lock of `name`
    fn construct(&self, name: &str) -> Result<Arc<FileNodeProcessor>> {
        // another thread may have built it while we waited
        if let Some(processor) = self.processors.read().get(name) {
            return Ok(processor.clone());
        }
        let processor = FileNodeProcessor::open(name, &self.ctx)
            .map(Arc::new)
            .map_err(|e| e.in_storage_group(name))?;
        self.processors
            .write()
            .insert(name.to_string(), processor.clone());
        info!("Constructed processor of storage group {}", name);
        Ok(processor)
    }

    // caller holds the init lock of the processor's group
    fn unregister(&self, processor: &Arc<FileNodeProcessor>) {
        let mut processors = self.processors.write();
        if processors
            .get(processor.name())
            .is_some_and(|p| Arc::ptr_eq(p, processor))
        {
            processors.remove(processor.name());
        }
    }

    /// Build a fresh processor in place of one closed while a caller held it
    fn reopen(&self, closed: &Arc<FileNodeProcessor>) -> Result<Arc<FileNodeProcessor>> {
        let init_lock = self.init_lock(closed.name());
        let _guard = init_lock.lock();
        self.unregister(closed);
        self.construct(closed.name())
    }

    /// Run `op` against the group owning `device`, reopening the group once
    /// if it was closed between lookup and use
    fn with_processor<T, F>(&self, device: &str, op: F) -> Result<T>
    where
        F: Fn(&FileNodeProcessor) -> Result<T>,
    {
        let processor = self.get_processor(device)?;
        let result = match op(&*processor) {
            Err(TesseraError::Closed(_)) if processor.is_closed() => {
                debug!("{} was closed under a caller, reopening", processor.name());
                self.reopen(&processor).and_then(|reopened| op(&*reopened))
            }
            result => result,
        };
        result.map_err(|e| e.in_storage_group(processor.name()))
    }

    fn registered(&self) -> Vec<Arc<FileNodeProcessor>> {
        self.processors.read().values().cloned().collect()
    }

    /// Route one record to its storage group.
    ///
    /// Monitor writes are not counted in the statistics.
    pub fn insert(&self, record: &TsRecord, is_monitor: bool) -> Result<InsertType> {
        let points = record.points.len() as u64;
        if !is_monitor {
            self.counters.total_points.fetch_add(points, Ordering::Relaxed);
        }
        let result = self.insert_record(record);
        if !is_monitor {
            let (requests, counted) = if result.is_ok() {
                (&self.counters.successful_requests, &self.counters.successful_points)
            } else {
                (&self.counters.failed_requests, &self.counters.failed_points)
            };
            requests.fetch_add(1, Ordering::Relaxed);
            counted.fetch_add(points, Ordering::Relaxed);
        }
        result
    }

    fn insert_record(&self, record: &TsRecord) -> Result<InsertType> {
        if record.timestamp < 0 {
            return Err(TesseraError::InvalidTimestamp {
                device: record.device.clone(),
                timestamp: record.timestamp,
            });
        }
        self.with_processor(&record.device, |processor| processor.insert(record))
    }

    pub fn update(
        &self,
        device: &str,
        measurement: &str,
        start: Timestamp,
        end: Timestamp,
        value: Value,
    ) -> Result<()> {
        self.with_processor(device, |processor| {
            processor.update(device, measurement, start, end, value.clone())
        })
    }

    pub fn delete(&self, device: &str, measurement: &str, timestamp: Timestamp) -> Result<()> {
        self.with_processor(device, |processor| {
            processor.delete(device, measurement, timestamp)
        })
    }

    /// Source bundle of one series
    pub fn query(&self, device: &str, measurement: &str) -> Result<QueryDataSource> {
        self.with_processor(device, |processor| processor.query(device, measurement))
    }

    /// Register a query against the group owning `device`
    pub fn begin_query(&self, device: &str) -> Result<u64> {
        Ok(self.get_processor(device)?.begin_query())
    }

    pub fn end_query(&self, device: &str, token: u64) -> Result<()> {
        let processor = self.get_processor(device)?;
        processor
            .end_query(token)
            .map_err(|e| e.in_storage_group(processor.name()))
    }

    /// Read a whole series through the merged query path
    pub fn read_series(
        &self,
        device: &str,
        measurement: &str,
        filter: Option<Filter>,
        reverse: bool,
    ) -> Result<Vec<TimeValuePair>> {
        self.with_processor(device, |processor| {
            let token = processor.begin_query();
            let job = self.next_job.fetch_add(1, Ordering::Relaxed);
            let result = processor.query(device, measurement).and_then(|source| {
                let ctx = Arc::new(QueryContext::new(job));
                let mut reader = SeriesReader::new(source, filter.clone(), ctx, reverse)?;
                read_all(&mut reader)
            });
            processor.end_query(token)?;
            result
        })
    }

    /// Merge every overflowed storage group and wait for all of them.
    ///
    /// Every merge runs to completion; the first failure is returned once
    /// all are done.
    pub fn merge_all(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status != ManagerStatus::None {
                return Err(TesseraError::InvalidState(format!(
                    "cannot merge while status is {:?}",
                    *status
                )));
            }
            *status = ManagerStatus::Merge;
        }
        let result = self.run_merges();
        *self.status.lock() = ManagerStatus::None;
        result
    }

    fn run_merges(&self) -> Result<()> {
        let mut first_error = None;
        let mut futures: Vec<(String, TaskFuture<()>)> = Vec::new();
        for processor in self.registered() {
            match processor.submit_to_merge() {
                Ok(Some(future)) => futures.push((processor.name().to_string(), future)),
                Ok(None) => debug!("{} has no overflow data", processor.name()),
                Err(e) => {
                    error!("Cannot start merge of {}: {}", processor.name(), e);
                    first_error.get_or_insert(e.in_storage_group(processor.name()));
                }
            }
        }
        info!("Waiting for {} merges", futures.len());

        for (name, future) in futures {
            let mut interval = self.ctx.config.merge_poll_initial();
            let result = loop {
                match future.wait_timeout(interval) {
                    Some(result) => break result,
                    None => {
                        debug!("Merge of {} still running", name);
                        interval = (interval * 2).min(self.ctx.config.merge_poll_max());
                    }
                }
            };
            if let Err(e) = result {
                error!("Merge of {} failed: {}", name, e);
                first_error.get_or_insert(e.in_storage_group(&name));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flush processors in answer to memory pressure; returns how many were
    /// asked to flush.
    ///
    /// Dangerous flushes everything, warning the heaviest tenth and safe the
    /// heaviest hundredth, the latter only while the flush pool is mostly idle.
    pub fn force_flush(&self, level: UsageLevel) -> Result<usize> {
        let mut candidates: Vec<(u64, Arc<FileNodeProcessor>)> = self
            .registered()
            .into_iter()
            .map(|p| (p.memory_usage(), p))
            .filter(|(usage, _)| *usage > 0)
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let count = match level {
            UsageLevel::Dangerous => candidates.len(),
            UsageLevel::Warning => candidates.len().div_ceil(10).max(1),
            UsageLevel::Safe => {
                let pool = &self.ctx.flush_pool;
                if pool.active_count() * 2 >= pool.thread_count() {
                    debug!("Flush pool is busy, skipping opportunistic flush");
                    return Ok(0);
                }
                (candidates.len() / 100).max(1)
            }
        };
        for (usage, processor) in candidates.iter().take(count) {
            debug!("Force flushing {} holding {} bytes", processor.name(), usage);
            processor
                .flush()
                .map_err(|e| e.in_storage_group(processor.name()))?;
        }
        info!("Forced flush of {} storage groups at {:?}", count, level);
        Ok(count)
    }

    /// Retry `op` while the processor is busy, up to the configured attempts.
    ///
    /// `op` runs under the group's init lock, so nobody rebuilds the group
    /// until it has been dropped from the registry.
    fn with_retry<F>(&self, name: &str, op: F) -> Result<()>
    where
        F: Fn(&FileNodeProcessor) -> Result<()>,
    {
        if !self.catalog.contains_storage_group(name) {
            return Err(TesseraError::StorageGroupNotFound(name.to_string()));
        }
        let processor = self.processor(name)?;
        let attempts = self.ctx.config.close_max_attempts.max(1);
        for attempt in 1..=attempts {
            if processor.can_be_closed() {
                let init_lock = self.init_lock(name);
                let _guard = init_lock.lock();
                match op(&*processor) {
                    Ok(()) => {
                        self.unregister(&processor);
                        return Ok(());
                    }
                    Err(e) if e.is_retryable() => {
                        debug!("{} busy on attempt {}: {}", name, attempt, e);
                    }
                    Err(e) => return Err(e.in_storage_group(name)),
                }
            }
            if attempt < attempts {
                thread::sleep(self.ctx.config.close_retry_interval());
            }
        }
        warn!("Giving up on {} after {} attempts", name, attempts);
        Err(TesseraError::Busy(format!("{} stayed busy", name)))
    }

    /// Close one storage group and drop it from the registry
    pub fn close_one_file_node(&self, name: &str) -> Result<()> {
        self.check_not_merging()?;
        self.with_retry(name, FileNodeProcessor::close)
    }

    /// Close one storage group and remove all its data
    pub fn delete_one_file_node(&self, name: &str) -> Result<()> {
        self.check_not_merging()?;
        self.with_retry(name, FileNodeProcessor::delete_data)
    }

    fn check_not_merging(&self) -> Result<()> {
        if *self.status.lock() == ManagerStatus::Merge {
            return Err(TesseraError::Busy("a merge is running".into()));
        }
        Ok(())
    }

    /// Apply `op` to every registered group under the close status
    fn for_every_group<F>(&self, op: F) -> Result<()>
    where
        F: Fn(&str) -> Result<()>,
    {
        {
            let mut status = self.status.lock();
            if *status != ManagerStatus::None {
                return Err(TesseraError::Busy(format!("status is {:?}", *status)));
            }
            *status = ManagerStatus::Close;
        }
        let names: Vec<String> = self.processors.read().keys().cloned().collect();
        let mut first_error = None;
        for name in names {
            if let Err(e) = op(&name) {
                error!("Cannot close {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        *self.status.lock() = ManagerStatus::None;
        first_error.map_or(Ok(()), Err)
    }

    pub fn close_all(&self) -> Result<()> {
        info!("Closing all storage groups");
        self.for_every_group(|name| self.with_retry(name, FileNodeProcessor::close))
    }

    /// Delete every registered group; true if the registry ended up empty
    pub fn delete_all(&self) -> Result<bool> {
        info!("Deleting all storage groups");
        self.for_every_group(|name| self.with_retry(name, FileNodeProcessor::delete_data))?;
        Ok(self.processors.read().is_empty())
    }

    /// Construct every storage group of the catalog, replaying its logs
    pub fn recovery(&self) -> Result<()> {
        let groups = self.catalog.storage_groups();
        for name in &groups {
            self.processor(name)?;
        }
        info!("Recovered {} storage groups", groups.len());
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let storage_groups: Vec<FileNodeStats> =
            self.registered().iter().map(|p| p.stats()).collect();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        EngineStats {
            status: self.status(),
            total_points: load(&self.counters.total_points),
            successful_requests: load(&self.counters.successful_requests),
            failed_requests: load(&self.counters.failed_requests),
            successful_points: load(&self.counters.successful_points),
            failed_points: load(&self.counters.failed_points),
            memory_usage: storage_groups.iter().map(|s| s.memory_usage).sum(),
            storage_groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.memtable_size_threshold = u64::MAX / 4;
        config.close_retry_interval_ms = 1;
        config.close_max_attempts = 3;
        config.merge_poll_initial_ms = 1;
        config.merge_poll_max_ms = 4;
        config
    }

    fn manager(config: EngineConfig) -> FileNodeManager {
        let ctx = EngineContext::new(config).unwrap();
        let catalog =
            InMemoryCatalog::with_storage_groups(["root.sg1", "root.sg2"]).unwrap();
        FileNodeManager::new(ctx, Arc::new(catalog))
    }

    fn record(device: &str, ts: i64, value: i64) -> TsRecord {
        TsRecord::new(device, ts).with_point("s1", value)
    }

    fn times(manager: &FileNodeManager, device: &str) -> Vec<i64> {
        manager
            .read_series(device, "s1", Some(Filter::time(0, 200)), false)
            .unwrap()
            .iter()
            .map(|p| p.timestamp)
            .collect()
    }

    #[test]
    fn test_out_of_order_write_after_flush_overflows() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(config(&temp_dir));

        let d1 = "root.sg1.d1";
        assert_eq!(manager.insert(&record(d1, 100, 1), false).unwrap(), InsertType::BufferWrite);
        assert_eq!(manager.force_flush(UsageLevel::Dangerous).unwrap(), 1);
        assert_eq!(manager.insert(&record(d1, 50, 2), false).unwrap(), InsertType::Overflow);
        assert_eq!(times(&manager, d1), vec![50, 100]);
    }

    #[test]
    fn test_unknown_group_and_bad_timestamp_fail() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(config(&temp_dir));

        let err = manager.insert(&record("root.other.d1", 1, 1), false).unwrap_err();
        assert!(matches!(err.root(), TesseraError::StorageGroupNotFound(_)));
        let err = manager.insert(&record("root.sg1.d1", -5, 1), false).unwrap_err();
        assert!(matches!(err.root(), TesseraError::InvalidTimestamp { .. }));
        manager.insert(&record("root.sg1.d1", 5, 1), true).unwrap();
        manager.insert(&record("root.sg1.d1", 6, 1), false).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.failed_requests, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.total_points, 3);
    }

    #[test]
    fn test_concurrent_first_writes_build_one_processor() {
        let temp_dir = TempDir::new().unwrap();
        let manager = Arc::new(manager(config(&temp_dir)));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                thread::spawn(move || {
                    let device = if i % 2 == 0 { "root.sg1.d1" } else { "root.sg2.d1" };
                    let processor = manager.get_processor(device).unwrap();
                    manager.insert(&record(device, i, 1), false).unwrap();
                    processor
                })
            })
            .collect();
        let processors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for pair in processors.chunks(2).collect::<Vec<_>>().windows(2) {
            assert!(Arc::ptr_eq(&pair[0][0], &pair[1][0]));
            assert!(Arc::ptr_eq(&pair[0][1], &pair[1][1]));
        }
        assert_eq!(manager.stats().storage_groups.len(), 2);
        assert_eq!(times(&manager, "root.sg1.d1"), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_force_flush_levels() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(config(&temp_dir));
        assert_eq!(manager.force_flush(UsageLevel::Dangerous).unwrap(), 0);

        manager.insert(&record("root.sg1.d1", 1, 1), false).unwrap();
        manager.insert(&record("root.sg2.d1", 1, 1), false).unwrap();
        manager.insert(&record("root.sg2.d1", 2, 1), false).unwrap();

        assert_eq!(manager.force_flush(UsageLevel::Warning).unwrap(), 1);
        let stats = manager.stats();
        let sg2 = stats.storage_groups.iter().find(|s| s.name == "root.sg2").unwrap();
        assert_eq!(sg2.memory_usage, 0);

        assert_eq!(manager.force_flush(UsageLevel::Dangerous).unwrap(), 1);
        assert_eq!(manager.stats().memory_usage, 0);
    }

    #[test]
    fn test_merge_all_folds_overflow() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(config(&temp_dir));
        let d1 = "root.sg1.d1";
        for ts in [10, 20] {
            manager.insert(&record(d1, ts, 1), false).unwrap();
        }
        manager.force_flush(UsageLevel::Dangerous).unwrap();
        manager.insert(&record(d1, 15, 2), false).unwrap();
        // groups without overflow data are skipped
        manager.insert(&record("root.sg2.d1", 1, 1), false).unwrap();

        manager.merge_all().unwrap();
        assert_eq!(manager.status(), ManagerStatus::None);
        let processor = manager.get_processor(d1).unwrap();
        assert!(!processor.is_overflowed());
        assert_eq!(times(&manager, d1), vec![10, 15, 20]);
    }

    #[test]
    fn test_close_waits_for_queries_then_gives_up() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(config(&temp_dir));
        manager.insert(&record("root.sg1.d1", 1, 1), false).unwrap();

        let token = manager.begin_query("root.sg1.d1").unwrap();
        assert!(matches!(
            manager.close_one_file_node("root.sg1"),
            Err(TesseraError::Busy(_))
        ));
        manager.end_query("root.sg1.d1", token).unwrap();
        manager.close_one_file_node("root.sg1").unwrap();
        assert!(manager.stats().storage_groups.is_empty());

        // the next access reopens the group from disk
        assert_eq!(times(&manager, "root.sg1.d1"), vec![1]);
    }

    #[test]
    fn test_close_all_and_recovery() {
        let temp_dir = TempDir::new().unwrap();
        {
            let manager = manager(config(&temp_dir));
            manager.insert(&record("root.sg1.d1", 7, 1), false).unwrap();
            manager.insert(&record("root.sg2.d1", 8, 1), false).unwrap();
            manager.close_all().unwrap();
            assert!(manager.stats().storage_groups.is_empty());
        }
        let manager = manager(config(&temp_dir));
        manager.recovery().unwrap();
        assert_eq!(manager.stats().storage_groups.len(), 2);
        assert_eq!(times(&manager, "root.sg1.d1"), vec![7]);
        assert_eq!(times(&manager, "root.sg2.d1"), vec![8]);
    }

    #[test]
    fn test_delete_all_removes_data() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        let sequence_dir = config.sequence_dir("root.sg1");
        let manager = manager(config);
        manager.insert(&record("root.sg1.d1", 1, 1), false).unwrap();
        manager.insert(&record("root.sg2.d1", 1, 1), false).unwrap();

        assert!(manager.delete_all().unwrap());
        assert!(!sequence_dir.exists());
        assert!(times(&manager, "root.sg1.d1").is_empty());
    }

    #[test]
    fn test_construction_of_one_group_does_not_block_another() {
        let temp_dir = TempDir::new().unwrap();
        let manager = Arc::new(manager(config(&temp_dir)));

        let sg1 = manager.init_lock("root.sg1");
        let held = sg1.lock();
        let blocked = {
            let manager = manager.clone();
            thread::spawn(move || manager.insert(&record("root.sg1.d1", 1, 1), false))
        };

        assert_eq!(
            manager.insert(&record("root.sg2.d1", 1, 1), false).unwrap(),
            InsertType::BufferWrite
        );
        assert!(!blocked.is_finished());
        drop(held);
        assert_eq!(blocked.join().unwrap().unwrap(), InsertType::BufferWrite);
        assert_eq!(manager.stats().storage_groups.len(), 2);
    }

    #[test]
    fn test_write_to_group_closed_under_it_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(config(&temp_dir));
        manager.insert(&record("root.sg1.d1", 1, 1), false).unwrap();

        // closed while still registered, as seen by a writer racing a close
        let stale = manager.get_processor("root.sg1.d1").unwrap();
        stale.close().unwrap();

        assert_eq!(
            manager.insert(&record("root.sg1.d1", 2, 1), false).unwrap(),
            InsertType::BufferWrite
        );
        let current = manager.get_processor("root.sg1.d1").unwrap();
        assert!(!Arc::ptr_eq(&stale, &current));
        assert!(!current.is_closed());
        assert_eq!(times(&manager, "root.sg1.d1"), vec![1, 2]);
        assert_eq!(manager.stats().failed_requests, 0);

        // a regular close drops the rebuilt processor from the registry
        manager.close_one_file_node("root.sg1").unwrap();
        assert_eq!(manager.stats().storage_groups.len(), 0);
    }
}
