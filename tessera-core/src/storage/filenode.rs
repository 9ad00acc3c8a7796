//! Storage group processor
//!
//! Routes every write to the buffer-write or overflow path, keeps the
//! per-device high-water-marks that drive that decision, owns the list of
//! sealed files and assembles query sources. Structural changes (routing,
//! rollover, close, merge swap) run under the write half of one lock;
//! queries assemble their sources under the read half.
//!
//! Metadata touched by flush callbacks lives in a separate mutex so that a
//! flush task never needs the processor lock.

use super::merge::MergeTask;
use super::overflow::remove_unlisted_files;
use super::processor::{FlushListener, InsertType, Processor};
use super::{
    data_file_name, read_store, write_store, BufferWriteProcessor, EngineContext,
    OverflowProcessor, TsFileResource,
};
use crate::memcontrol::UsageLevel;
use crate::modification::{Deletion, ModificationFile};
use crate::pool::TaskFuture;
use crate::query::reader::{read_all, SeriesReader};
use crate::query::{
    Filter, GlobalSortedSeriesDataSource, QueryContext, QueryDataSource, UnsealedTsFile,
};
use crate::tsfile::{ChunkGroupMetadata, TsFileReader};
use crate::version::{SimpleFileVersionController, VersionController};
use crate::wal::{LogRecord, WriteLogNode};
use crate::{Result, SeriesPath, TesseraError, TimeRange, Timestamp, TsRecord, Value};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const STORE_FILE: &str = "filenode.store";

// job id of reads issued by the engine itself
const INTERNAL_JOB: u64 = 0;

/// Persisted form of the metadata
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileNodeStore {
    flush_last_update: BTreeMap<String, Timestamp>,
    sealed: Vec<TsFileResource>,
    current: Option<TsFileResource>,
    overflowed: bool,
}

#[derive(Debug, Default)]
struct FileNodeMeta {
    // highest timestamp accepted per device
    last_update: HashMap<String, Timestamp>,
    // high-water-mark as of the last flush start; routes new writes
    flush_last_update: HashMap<String, Timestamp>,
    sealed: Vec<TsFileResource>,
    // resource of the open file
    current: Option<TsFileResource>,
    overflowed: bool,
}

impl FileNodeMeta {
    fn from_store(store: FileNodeStore) -> Self {
        let flush_last_update: HashMap<_, _> = store.flush_last_update.into_iter().collect();
        Self {
            last_update: flush_last_update.clone(),
            flush_last_update,
            sealed: store.sealed,
            current: store.current,
            overflowed: store.overflowed,
        }
    }

    fn to_store(&self) -> FileNodeStore {
        FileNodeStore {
            flush_last_update: self
                .flush_last_update
                .iter()
                .map(|(d, t)| (d.clone(), *t))
                .collect(),
            sealed: self.sealed.clone(),
            current: self.current.clone(),
            overflowed: self.overflowed,
        }
    }

    fn last_update(&self, device: &str) -> Timestamp {
        self.last_update.get(device).copied().unwrap_or(-1)
    }
}

/// Flush callbacks of the buffer-write processor
struct MetaListener {
    name: String,
    meta: Arc<Mutex<FileNodeMeta>>,
    store_path: PathBuf,
}

impl MetaListener {
    fn persist(&self) -> Result<()> {
        let store = self.meta.lock().to_store();
        write_store(&self.store_path, &store)
    }
}

impl FlushListener for MetaListener {
    fn on_flush_start(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.flush_last_update = meta.last_update.clone();
        Ok(())
    }

    fn on_flush_end(&self, groups: &[ChunkGroupMetadata]) -> Result<()> {
        debug!("{} persisted after {} chunk groups", self.name, groups.len());
        self.persist()
    }

    fn on_close(&self) -> Result<()> {
        {
            let mut meta = self.meta.lock();
            if let Some(path) = meta.current.as_ref().map(|c| c.path.clone()) {
                let sealed = TsFileResource::from_sealed_file(&path)?;
                meta.current = None;
                if sealed.start_times.is_empty() {
                    sealed.remove()?;
                } else {
                    meta.sealed.push(sealed);
                }
            }
        }
        self.persist()
    }
}

struct MergeState {
    // sealed files in the snapshot, a prefix of the sealed list
    sealed_count: usize,
    // deletions issued while the merge runs
    deletions: Vec<Deletion>,
}

struct FileNodeState {
    bufferwrite: Option<BufferWriteProcessor>,
    overflow: OverflowProcessor,
    merge: Option<MergeState>,
    closed: bool,
}

impl FileNodeState {
    fn processors(&mut self) -> Vec<&mut dyn Processor> {
        let mut processors: Vec<&mut dyn Processor> = Vec::with_capacity(2);
        if let Some(bufferwrite) = self.bufferwrite.as_mut() {
            processors.push(bufferwrite);
        }
        processors.push(&mut self.overflow);
        processors
    }
}

#[derive(Default)]
struct QueryTokens {
    next: u64,
    active: HashSet<u64>,
    // files replaced by a merge, removed once no query is running
    obsolete: Vec<TsFileResource>,
}

/// Snapshot of one storage group
#[derive(Debug, Clone)]
pub struct FileNodeStats {
    pub name: String,
    pub memory_usage: u64,
    pub sealed_files: usize,
    pub overflow_files: usize,
    pub overflowed: bool,
    pub merging: bool,
    pub active_queries: usize,
}

/// Processor of one storage group
pub struct FileNodeProcessor {
    name: String,
    ctx: EngineContext,
    sequence_dir: PathBuf,
    store_path: PathBuf,
    version: Arc<dyn VersionController>,
    meta: Arc<Mutex<FileNodeMeta>>,
    listener: Arc<MetaListener>,
    bufferwrite_wal: Option<Arc<WriteLogNode>>,
    overflow_wal: Option<Arc<WriteLogNode>>,
    state: RwLock<FileNodeState>,
    queries: Mutex<QueryTokens>,
}

impl FileNodeProcessor {
    /// Open a storage group, recovering its files and replaying its log nodes
    pub fn open(name: &str, ctx: &EngineContext) -> Result<Self> {
        let config = &ctx.config;
        let sequence_dir = config.sequence_dir(name);
        let system_dir = config.system_dir(name);
        fs::create_dir_all(&sequence_dir)?;
        fs::create_dir_all(&system_dir)?;

        let version: Arc<dyn VersionController> =
            Arc::new(SimpleFileVersionController::open(&system_dir)?);
        let store_path = system_dir.join(STORE_FILE);
        let store: FileNodeStore = read_store(&store_path)?.unwrap_or_default();
        let meta = Self::check_files(FileNodeMeta::from_store(store))?;

        let mut listed = meta.sealed.clone();
        listed.extend(meta.current.clone());
        remove_unlisted_files(&sequence_dir, &listed)?;

        let meta = Arc::new(Mutex::new(meta));
        let listener = Arc::new(MetaListener {
            name: name.to_string(),
            meta: meta.clone(),
            store_path: store_path.clone(),
        });

        let (bufferwrite_wal, overflow_wal) = if config.enable_wal {
            let open = |node: String| -> Result<Arc<WriteLogNode>> {
                Ok(Arc::new(WriteLogNode::open(&node, ctx.wal_config(&node))?))
            };
            (
                Some(open(format!("{}-bufferwrite", name))?),
                Some(open(format!("{}-overflow", name))?),
            )
        } else {
            (None, None)
        };
        let overflow = OverflowProcessor::open(name, ctx, version.clone(), overflow_wal.clone())?;

        let processor = Self {
            name: name.to_string(),
            ctx: ctx.clone(),
            sequence_dir,
            store_path,
            version,
            meta,
            listener,
            bufferwrite_wal,
            overflow_wal,
            state: RwLock::new(FileNodeState {
                bufferwrite: None,
                overflow,
                merge: None,
                closed: false,
            }),
            queries: Mutex::new(QueryTokens::default()),
        };
        processor.recover()?;
        debug!("Opened storage group {}", name);
        Ok(processor)
    }

    /// Drop listed files that vanished and seal the open file if it was
    /// sealed before its callback ran
    fn check_files(mut meta: FileNodeMeta) -> Result<FileNodeMeta> {
        meta.sealed.retain(|file| {
            let exists = file.path.exists();
            if !exists {
                warn!("Sealed file {:?} listed but missing", file.path);
            }
            exists
        });
        if let Some(current) = meta.current.take() {
            if !current.path.exists() {
                warn!("Open file {:?} listed but missing", current.path);
            } else if TsFileReader::is_sealed(&current.path)? {
                meta.sealed.push(TsFileResource::from_sealed_file(&current.path)?);
            } else {
                meta.current = Some(current);
            }
        }
        Ok(meta)
    }

    fn recover(&self) -> Result<()> {
        let mut state = self.state.write();
        let current = self.meta.lock().current.clone();
        if let Some(current) = current {
            state.bufferwrite = Some(self.open_bufferwrite(&current.path)?);
        }

        let mut replayed = 0;
        if let Some(wal) = &self.bufferwrite_wal {
            for record in wal.recover()? {
                replayed += 1;
                match record {
                    LogRecord::Insert(record) => {
                        // records the memtable rejected the first time are skipped
                        if let Err(e) = self.bufferwrite(&mut state)?.replay(&record) {
                            warn!("Skipping log record of {}: {}", record.device, e);
                            continue;
                        }
                        self.advance(&record);
                        self.note_start_time(&record);
                    }
                    LogRecord::Delete { path, timestamp } => {
                        if let Some(bufferwrite) = state.bufferwrite.as_mut() {
                            bufferwrite.delete(&path.device, &path.measurement, timestamp);
                        }
                    }
                    LogRecord::Update { .. } => {}
                }
            }
        }
        if let Some(wal) = &self.overflow_wal {
            for record in wal.recover()? {
                replayed += 1;
                match record {
                    LogRecord::Insert(record) => {
                        if let Err(e) = state.overflow.replay(&record) {
                            warn!("Skipping log record of {}: {}", record.device, e);
                            continue;
                        }
                        self.meta.lock().overflowed = true;
                    }
                    LogRecord::Update { path, range, value } => {
                        let targets = self.update_targets(&state, &path, range, &value)?;
                        if !targets.is_empty() {
                            state.overflow.replay_update(
                                &path.device,
                                &path.measurement,
                                &targets,
                                &value,
                            )?;
                            self.meta.lock().overflowed = true;
                        }
                    }
                    LogRecord::Delete { path, timestamp } => {
                        state
                            .overflow
                            .delete_buffered(&path.device, &path.measurement, timestamp);
                    }
                }
            }
        }

        if replayed > 0 {
            info!("Replayed {} log records of {}", replayed, self.name);
            for processor in state.processors() {
                processor.flush()?.wait()?;
            }
        }
        Ok(())
    }

    fn open_bufferwrite(&self, path: &Path) -> Result<BufferWriteProcessor> {
        BufferWriteProcessor::open(
            &format!("{}-bufferwrite", self.name),
            path,
            &self.ctx,
            self.version.clone(),
            self.listener.clone(),
            self.bufferwrite_wal.clone(),
        )
    }

    /// The buffer-write processor, opening a new file if none is open
    fn bufferwrite<'a>(&self, state: &'a mut FileNodeState) -> Result<&'a mut BufferWriteProcessor> {
        if state.bufferwrite.is_none() {
            let version = self.version.next_version()?;
            let path = self.sequence_dir.join(data_file_name(version));
            let bufferwrite = self.open_bufferwrite(&path)?;
            self.meta.lock().current = Some(TsFileResource::new(&path));
            self.listener.persist()?;
            info!("Opened buffer-write file {:?} for {}", path, self.name);
            state.bufferwrite = Some(bufferwrite);
        }
        state
            .bufferwrite
            .as_mut()
            .ok_or_else(|| TesseraError::Internal(format!("{} has no open file", self.name)))
    }

    /// Raise the high-water-mark of the record's device, returning the old one
    fn advance(&self, record: &TsRecord) -> Option<Timestamp> {
        let mut meta = self.meta.lock();
        let previous = meta.last_update.get(&record.device).copied();
        let next = previous.map_or(record.timestamp, |p| p.max(record.timestamp));
        meta.last_update.insert(record.device.clone(), next);
        previous
    }

    fn note_start_time(&self, record: &TsRecord) {
        if let Some(current) = self.meta.lock().current.as_mut() {
            current.update_start_time(&record.device, record.timestamp);
        }
    }

    fn check_open(&self, state: &FileNodeState) -> Result<()> {
        if state.closed {
            return Err(TesseraError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn check_admission(&self, record: &TsRecord) -> Result<()> {
        if self.ctx.mem.current_level() == UsageLevel::Dangerous {
            warn!(
                "Rejecting write of {} at {}: memory is dangerously full",
                record.device, record.timestamp
            );
            return Err(TesseraError::Rejected(format!(
                "{} write of {} at {}",
                self.name, record.device, record.timestamp
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route and apply one write.
    ///
    /// Points older than the flushed high-water-mark of their device go to
    /// the overflow path; everything else is appended to the open file's
    /// memtable, after which the file is rolled over if it grew too large.
    pub fn insert(&self, record: &TsRecord) -> Result<InsertType> {
        if record.timestamp < 0 {
            return Err(TesseraError::InvalidTimestamp {
                device: record.device.clone(),
                timestamp: record.timestamp,
            });
        }
        let mut state = self.state.write();
        self.check_open(&state)?;
        self.check_admission(record)?;

        let flush_last = self
            .meta
            .lock()
            .flush_last_update
            .get(&record.device)
            .copied()
            .unwrap_or(-1);
        // memory is reserved before the record is logged
        if record.timestamp < flush_last {
            let level = state.overflow.reserve(record)?;
            if let Some(wal) = &self.overflow_wal {
                if let Err(e) = wal.write(&LogRecord::Insert(record.clone())) {
                    state.overflow.cancel(record);
                    return Err(e);
                }
            }
            state.overflow.insert_reserved(record, level)?;
            self.meta.lock().overflowed = true;
            return Ok(InsertType::Overflow);
        }

        let bufferwrite = self.bufferwrite(&mut state)?;
        let level = bufferwrite.reserve(record)?;
        if let Some(wal) = &self.bufferwrite_wal {
            if let Err(e) = wal.write(&LogRecord::Insert(record.clone())) {
                bufferwrite.cancel(record);
                return Err(e);
            }
        }
        let previous = self.advance(record);
        if let Err(e) = bufferwrite.write_reserved(record, level) {
            let mut meta = self.meta.lock();
            match previous {
                Some(previous) => meta.last_update.insert(record.device.clone(), previous),
                None => meta.last_update.remove(&record.device),
            };
            return Err(e);
        }
        self.note_start_time(record);

        let size = bufferwrite.file_size() + bufferwrite.memory_usage();
        if size > self.ctx.config.bufferwrite_file_size_threshold {
            info!(
                "{:?} reached {} bytes, rolling over",
                bufferwrite.path(),
                size
            );
            // the record is already accepted; a failing seal is not its error
            if let Err(e) = self.rollover(&mut state) {
                error!("Rollover of {} failed: {}", self.name, e);
            }
        }
        Ok(InsertType::BufferWrite)
    }

    /// Seal the open file; the next in-order write opens a new one
    fn rollover(&self, state: &mut FileNodeState) -> Result<()> {
        let Some(mut bufferwrite) = state.bufferwrite.take() else {
            return Ok(());
        };
        let result = bufferwrite.close();
        if !bufferwrite.is_closed() {
            state.bufferwrite = Some(bufferwrite);
        }
        result
    }

    /// Set every point of the series in `[start, end]` to `value`.
    ///
    /// The range is clamped to the device's high-water-mark. Existing points
    /// are read through the full query path and rewritten as overflow points.
    pub fn update(
        &self,
        device: &str,
        measurement: &str,
        start: Timestamp,
        end: Timestamp,
        value: Value,
    ) -> Result<()> {
        let mut state = self.state.write();
        self.check_open(&state)?;
        let last = self.meta.lock().last_update(device);
        if last < 0 {
            return Ok(());
        }
        let range = TimeRange::new(start, end.min(last));
        if range.is_empty() {
            return Ok(());
        }
        let path = SeriesPath::new(device, measurement);
        let targets = self.update_targets(&state, &path, range, &value)?;
        if targets.is_empty() {
            return Ok(());
        }
        let pending = state
            .overflow
            .reserve_update(device, measurement, &targets, &value)?;
        if let Some(wal) = &self.overflow_wal {
            let logged = wal.write(&LogRecord::Update {
                path: path.clone(),
                range,
                value: value.clone(),
            });
            if let Err(e) = logged {
                state.overflow.cancel_update(pending);
                return Err(e);
            }
        }
        let points = pending.len();
        state.overflow.apply_update(pending)?;
        self.meta.lock().overflowed = true;
        debug!("Updated {} points of {}", points, path);
        Ok(())
    }

    /// Timestamps of the existing points an update rewrites
    fn update_targets(
        &self,
        state: &FileNodeState,
        path: &SeriesPath,
        range: TimeRange,
        value: &Value,
    ) -> Result<Vec<Timestamp>> {
        let source = self.query_source(state, &path.device, &path.measurement);
        let ctx = Arc::new(QueryContext::new(INTERNAL_JOB));
        let mut reader = SeriesReader::new(source, Some(Filter::Time(range)), ctx, false)?;
        let points = read_all(&mut reader)?;
        if let Some(first) = points.first() {
            if first.value.data_type() != value.data_type() {
                return Err(TesseraError::InvalidValue(format!(
                    "{} is {}, got {}",
                    path,
                    first.value.data_type(),
                    value.data_type()
                )));
            }
        }
        Ok(points.into_iter().map(|p| p.timestamp).collect())
    }

    /// Delete points of a series at or before `timestamp`.
    ///
    /// Sealed and open files get a tombstone, memtables drop the points. A
    /// running merge re-applies the tombstone to the file it produces.
    pub fn delete(&self, device: &str, measurement: &str, timestamp: Timestamp) -> Result<()> {
        let mut state = self.state.write();
        self.check_open(&state)?;
        let last = self.meta.lock().last_update(device);
        if last < 0 {
            return Ok(());
        }
        let timestamp = timestamp.min(last);
        let path = SeriesPath::new(device, measurement);
        for wal in self.bufferwrite_wal.iter().chain(self.overflow_wal.iter()) {
            wal.write(&LogRecord::Delete {
                path: path.clone(),
                timestamp,
            })?;
        }

        let version = self.version.next_version()?;
        let deletion = Deletion::new(path, version, timestamp);
        let sealed = self.meta.lock().sealed.clone();
        for file in sealed
            .iter()
            .filter(|f| f.start_time(device).is_some_and(|s| s <= timestamp))
        {
            file.modification_file().write(&deletion)?;
        }
        if let Some(bufferwrite) = state.bufferwrite.as_mut() {
            // chunks of an in-flight flush land in the file after this point
            ModificationFile::for_data_file(bufferwrite.path()).write(&deletion)?;
            bufferwrite.delete(device, measurement, timestamp);
        }
        state
            .overflow
            .delete(device, measurement, timestamp, version)?;
        if let Some(merge) = state.merge.as_mut() {
            merge.deletions.push(deletion);
        }
        info!(
            "Deleted {}.{} up to {} at version {}",
            device, measurement, timestamp, version
        );
        Ok(())
    }

    fn query_source(&self, state: &FileNodeState, device: &str, measurement: &str) -> QueryDataSource {
        let (mem, unsealed) = match &state.bufferwrite {
            Some(bufferwrite) => {
                let (mem, chunks) = bufferwrite.query(device, measurement);
                let unsealed = (!chunks.is_empty()).then(|| UnsealedTsFile {
                    path: bufferwrite.path().to_path_buf(),
                    chunks,
                });
                (mem, unsealed)
            }
            None => (None, None),
        };
        let sealed = self
            .meta
            .lock()
            .sealed
            .iter()
            .filter(|f| f.contains_device(device))
            .cloned()
            .collect();
        QueryDataSource {
            seq: GlobalSortedSeriesDataSource {
                path: SeriesPath::new(device, measurement),
                sealed,
                unsealed,
                mem,
            },
            overflow: state.overflow.query(device, measurement),
        }
    }

    /// Every source of one series
    pub fn query(&self, device: &str, measurement: &str) -> Result<QueryDataSource> {
        let state = self.state.read();
        self.check_open(&state)?;
        Ok(self.query_source(&state, device, measurement))
    }

    /// Register a running query; files it may read are kept until it ends
    pub fn begin_query(&self) -> u64 {
        let mut queries = self.queries.lock();
        queries.next += 1;
        let token = queries.next;
        queries.active.insert(token);
        token
    }

    pub fn end_query(&self, token: u64) -> Result<()> {
        let obsolete = {
            let mut queries = self.queries.lock();
            if !queries.active.remove(&token) {
                return Err(TesseraError::InvalidState(format!(
                    "query {} is not running on {}",
                    token, self.name
                )));
            }
            if queries.active.is_empty() {
                std::mem::take(&mut queries.obsolete)
            } else {
                Vec::new()
            }
        };
        remove_files(&obsolete);
        Ok(())
    }

    pub fn active_queries(&self) -> usize {
        self.queries.lock().active.len()
    }

    /// Remove files replaced by a merge, or defer until no query runs
    fn retire(&self, files: Vec<TsFileResource>) {
        let mut queries = self.queries.lock();
        if queries.active.is_empty() {
            drop(queries);
            remove_files(&files);
        } else {
            debug!("Deferring removal of {} files of {}", files.len(), self.name);
            queries.obsolete.extend(files);
        }
    }

    /// Start flushing both memtables
    pub fn flush(&self) -> Result<Vec<TaskFuture<()>>> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(Vec::new());
        }
        state.processors().into_iter().map(|p| p.flush()).collect()
    }

    /// Bytes buffered in both memtables
    pub fn memory_usage(&self) -> u64 {
        let state = self.state.read();
        state.bufferwrite.as_ref().map_or(0, |b| b.memory_usage()) + state.overflow.memory_usage()
    }

    /// True if overflow data awaits a merge
    pub fn is_overflowed(&self) -> bool {
        self.meta.lock().overflowed
    }

    pub fn is_merging(&self) -> bool {
        self.state.read().merge.is_some()
    }

    pub fn last_update_time(&self, device: &str) -> Option<Timestamp> {
        self.meta.lock().last_update.get(device).copied()
    }

    pub fn flush_last_update_time(&self, device: &str) -> Option<Timestamp> {
        self.meta.lock().flush_last_update.get(device).copied()
    }

    /// Sealed sequence files, oldest first
    pub fn sealed_files(&self) -> Vec<TsFileResource> {
        self.meta.lock().sealed.clone()
    }

    /// Start a merge of the overflow data into the sequence files.
    ///
    /// Returns `None` when there is nothing to merge. The open file is
    /// sealed first; writes and queries continue while the task runs.
    pub fn submit_to_merge(self: &Arc<Self>) -> Result<Option<TaskFuture<()>>> {
        let task = {
            let mut state = self.state.write();
            self.check_open(&state)?;
            if state.merge.is_some() {
                return Err(TesseraError::InvalidState(format!(
                    "{} is already merging",
                    self.name
                )));
            }
            if !self.meta.lock().overflowed {
                return Ok(None);
            }
            self.rollover(&mut state)?;
            let overflow = state.overflow.merge_snapshot()?;
            let sealed = self.meta.lock().sealed.clone();
            let version = match self.version.next_version() {
                Ok(version) => version,
                Err(e) => {
                    state.overflow.finish_merge(false)?;
                    return Err(e);
                }
            };
            state.merge = Some(MergeState {
                sealed_count: sealed.len(),
                deletions: Vec::new(),
            });
            MergeTask {
                storage_group: self.name.clone(),
                sealed,
                overflow,
                version,
                target: self.sequence_dir.join(data_file_name(version)),
                config: self.ctx.tsfile_config(),
            }
        };
        info!(
            "Merging {} sealed and {} overflow files of {}",
            task.sealed.len(),
            task.overflow.len(),
            self.name
        );
        let processor = self.clone();
        let future = self.ctx.merge_pool.submit(move || {
            let result = task.run();
            processor.finish_merge(result)
        });
        Ok(Some(future))
    }

    fn finish_merge(&self, result: Result<Option<TsFileResource>>) -> Result<()> {
        let mut state = self.state.write();
        let merge = state.merge.take().ok_or_else(|| {
            TesseraError::InvalidState(format!("{} finished a merge it never started", self.name))
        })?;
        let result = result.and_then(|merged| {
            if let Some(merged) = &merged {
                if let Err(e) = reapply_deletions(merged, &merge.deletions) {
                    if let Err(cleanup) = merged.remove() {
                        warn!("Cannot remove merge file {:?}: {}", merged.path, cleanup);
                    }
                    return Err(e);
                }
            }
            Ok(merged)
        });
        let merged = match result {
            Ok(merged) => merged,
            Err(e) => {
                error!("Merge of {} failed: {}", self.name, e);
                state.overflow.finish_merge(false)?;
                return Err(TesseraError::Merge(format!("{}: {}", self.name, e)));
            }
        };

        let (store, mut obsolete) = {
            let mut meta = self.meta.lock();
            let keep = merge.sealed_count.min(meta.sealed.len());
            let newer = meta.sealed.split_off(keep);
            let merged_files: Vec<TsFileResource> = merged.into_iter().collect();
            let old = std::mem::replace(&mut meta.sealed, merged_files);
            meta.sealed.extend(newer);
            meta.overflowed = state.overflow.has_unmerged_data();
            (meta.to_store(), old)
        };
        write_store(&self.store_path, &store)?;
        obsolete.extend(state.overflow.finish_merge(true)?);
        info!(
            "Merge of {} done, retiring {} files",
            self.name,
            obsolete.len()
        );
        drop(state);
        self.retire(obsolete);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    pub fn can_be_closed(&self) -> bool {
        self.active_queries() == 0 && !self.is_merging()
    }

    /// Seal the open file, flush the overflow memtable and persist the
    /// metadata. Fails with `Busy` while a merge or a structural change
    /// holds the processor.
    pub fn close(&self) -> Result<()> {
        let Some(mut state) = self.state.try_write() else {
            return Err(TesseraError::Busy(format!("{} is locked", self.name)));
        };
        if state.closed {
            return Ok(());
        }
        if state.merge.is_some() {
            return Err(TesseraError::Busy(format!("{} is merging", self.name)));
        }
        self.rollover(&mut state)?;
        state.overflow.close()?;
        self.listener.persist()?;
        state.closed = true;
        info!("Closed storage group {}", self.name);
        Ok(())
    }

    /// Close and remove every file, store and log node of the group
    pub fn delete_data(&self) -> Result<()> {
        if self.active_queries() > 0 {
            return Err(TesseraError::Busy(format!(
                "{} has running queries",
                self.name
            )));
        }
        self.close()?;
        let config = &self.ctx.config;
        for dir in [
            config.sequence_dir(&self.name),
            config.overflow_dir(&self.name),
            config.system_dir(&self.name),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        for wal in self.bufferwrite_wal.iter().chain(self.overflow_wal.iter()) {
            wal.delete()?;
        }
        info!("Deleted storage group {}", self.name);
        Ok(())
    }

    pub fn stats(&self) -> FileNodeStats {
        let state = self.state.read();
        let memory_usage =
            state.bufferwrite.as_ref().map_or(0, |b| b.memory_usage()) + state.overflow.memory_usage();
        let meta = self.meta.lock();
        FileNodeStats {
            name: self.name.clone(),
            memory_usage,
            sealed_files: meta.sealed.len(),
            overflow_files: state.overflow.files().len(),
            overflowed: meta.overflowed,
            merging: state.merge.is_some(),
            active_queries: self.active_queries(),
        }
    }
}

fn reapply_deletions(merged: &TsFileResource, deletions: &[Deletion]) -> Result<()> {
    let mods = merged.modification_file();
    for deletion in deletions {
        if merged
            .start_time(&deletion.path.device)
            .is_some_and(|s| s <= deletion.timestamp)
        {
            mods.write(deletion)?;
        }
    }
    Ok(())
}

fn remove_files(files: &[TsFileResource]) {
    for file in files {
        if let Err(e) = file.remove() {
            warn!("Cannot remove obsolete file {:?}: {}", file.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> EngineContext {
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.memtable_size_threshold = u64::MAX / 4;
        EngineContext::new(config).unwrap()
    }

    fn record(ts: i64, value: i64) -> TsRecord {
        TsRecord::new("root.sg.d1", ts).with_point("s1", value)
    }

    fn read(fnp: &FileNodeProcessor, filter: Option<Filter>) -> Vec<(i64, Value)> {
        let source = fnp.query("root.sg.d1", "s1").unwrap();
        let ctx = Arc::new(QueryContext::new(1));
        let mut reader = SeriesReader::new(source, filter, ctx, false).unwrap();
        read_all(&mut reader)
            .unwrap()
            .into_iter()
            .map(|p| (p.timestamp, p.value))
            .collect()
    }

    fn flush(fnp: &FileNodeProcessor) {
        for future in fnp.flush().unwrap() {
            future.wait().unwrap();
        }
    }

    #[test]
    fn test_routing_by_flushed_high_water_mark() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let fnp = FileNodeProcessor::open("root.sg", &ctx).unwrap();

        assert_eq!(fnp.insert(&record(100, 1)).unwrap(), InsertType::BufferWrite);
        // not flushed yet: older points still go to the open file
        assert_eq!(fnp.insert(&record(90, 1)).unwrap(), InsertType::BufferWrite);
        assert_eq!(fnp.flush_last_update_time("root.sg.d1"), None);

        flush(&fnp);
        assert_eq!(fnp.flush_last_update_time("root.sg.d1"), Some(100));
        assert_eq!(fnp.insert(&record(50, 2)).unwrap(), InsertType::Overflow);
        assert_eq!(fnp.insert(&record(100, 3)).unwrap(), InsertType::BufferWrite);
        assert!(fnp.is_overflowed());

        let points = read(&fnp, Some(Filter::time(0, 200)));
        assert_eq!(
            points,
            vec![
                (50, Value::Int64(2)),
                (90, Value::Int64(1)),
                (100, Value::Int64(3)),
            ]
        );
    }

    #[test]
    fn test_negative_timestamp_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let fnp = FileNodeProcessor::open("root.sg", &context(&temp_dir)).unwrap();
        assert!(matches!(
            fnp.insert(&record(-1, 1)),
            Err(TesseraError::InvalidTimestamp { .. })
        ));
        assert_eq!(fnp.last_update_time("root.sg.d1"), None);
    }

    #[test]
    fn test_rejected_write_restores_high_water_mark() {
        let temp_dir = TempDir::new().unwrap();
        let fnp = FileNodeProcessor::open("root.sg", &context(&temp_dir)).unwrap();
        fnp.insert(&record(10, 1)).unwrap();

        // a type clash fails inside the memtable after the optimistic update
        let clash = TsRecord::new("root.sg.d1", 20).with_point("s1", "text");
        assert!(fnp.insert(&clash).is_err());
        assert_eq!(fnp.last_update_time("root.sg.d1"), Some(10));
    }

    #[test]
    fn test_rejected_write_is_not_replayed() {
        let temp_dir = TempDir::new().unwrap();
        {
            let fnp = FileNodeProcessor::open("root.sg", &context(&temp_dir)).unwrap();
            fnp.insert(&record(100, 1)).unwrap();
            flush(&fnp);
        }
        {
            let mut config = EngineConfig::with_data_dir(temp_dir.path());
            config.mem_warning_threshold = 10;
            config.mem_dangerous_threshold = 20;
            let ctx = EngineContext::new(config).unwrap();
            let fnp = FileNodeProcessor::open("root.sg", &ctx).unwrap();

            for ts in [200, 50] {
                assert!(matches!(
                    fnp.insert(&record(ts, 2)),
                    Err(TesseraError::Rejected(_))
                ));
            }
            assert!(matches!(
                fnp.update("root.sg.d1", "s1", 0, 100, Value::Int64(9)),
                Err(TesseraError::Rejected(_))
            ));
            assert_eq!(ctx.mem.total_usage(), 0);
        }

        let fnp = FileNodeProcessor::open("root.sg", &context(&temp_dir)).unwrap();
        assert_eq!(fnp.last_update_time("root.sg.d1"), Some(100));
        assert!(!fnp.is_overflowed());
        assert_eq!(read(&fnp, None), vec![(100, Value::Int64(1))]);
    }

    #[test]
    fn test_failed_rollover_keeps_accepted_write() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_data_dir(temp_dir.path());
        config.memtable_size_threshold = u64::MAX / 4;
        config.bufferwrite_file_size_threshold = 300;
        let ctx = EngineContext::new(config).unwrap();
        let fnp = FileNodeProcessor::open("root.sg", &ctx).unwrap();
        fnp.insert(&record(1, 1)).unwrap();

        // the restore state of the open file cannot be written
        let open_file = fnp.meta.lock().current.clone().unwrap().path;
        let mut tmp = crate::tsfile::restore_path(&open_file).into_os_string();
        tmp.push(".tmp");
        fs::create_dir(&tmp).unwrap();

        let big = TsRecord::new("root.sg.d1", 2).with_point("s2", "x".repeat(400).as_str());
        assert_eq!(fnp.insert(&big).unwrap(), InsertType::BufferWrite);
        assert_eq!(fnp.last_update_time("root.sg.d1"), Some(2));
        assert!(fnp.sealed_files().is_empty());
        assert_eq!(read(&fnp, None), vec![(1, Value::Int64(1))]);

        fs::remove_dir(&tmp).unwrap();
        assert_eq!(fnp.insert(&record(3, 1)).unwrap(), InsertType::BufferWrite);
        assert_eq!(fnp.sealed_files().len(), 1);
        assert_eq!(
            read(&fnp, None),
            vec![(1, Value::Int64(1)), (3, Value::Int64(1))]
        );
    }

    #[test]
    fn test_rollover_seals_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_data_dir(temp_dir.path());
        config.bufferwrite_file_size_threshold = 1;
        let ctx = EngineContext::new(config).unwrap();
        let fnp = FileNodeProcessor::open("root.sg", &ctx).unwrap();

        fnp.insert(&record(1, 1)).unwrap();
        fnp.insert(&record(2, 1)).unwrap();
        let sealed = fnp.sealed_files();
        assert_eq!(sealed.len(), 2);
        assert_ne!(sealed[0].path, sealed[1].path);
        assert_eq!(sealed[0].end_time("root.sg.d1"), Some(1));
        assert_eq!(sealed[1].start_time("root.sg.d1"), Some(2));
        assert!(TsFileReader::is_sealed(&sealed[1].path).unwrap());
        assert_eq!(read(&fnp, None).len(), 2);
    }

    #[test]
    fn test_delete_masks_every_source() {
        let temp_dir = TempDir::new().unwrap();
        let fnp = FileNodeProcessor::open("root.sg", &context(&temp_dir)).unwrap();
        for ts in [10, 20] {
            fnp.insert(&record(ts, 1)).unwrap();
        }
        flush(&fnp);
        fnp.insert(&record(5, 1)).unwrap();
        fnp.insert(&record(30, 1)).unwrap();

        fnp.delete("root.sg.d1", "s1", 25).unwrap();
        assert_eq!(read(&fnp, None), vec![(30, Value::Int64(1))]);

        // unknown devices are a no-op
        fnp.delete("root.sg.d9", "s1", 25).unwrap();
    }

    #[test]
    fn test_update_overrides_existing_points() {
        let temp_dir = TempDir::new().unwrap();
        let fnp = FileNodeProcessor::open("root.sg", &context(&temp_dir)).unwrap();
        for ts in 1..=5 {
            fnp.insert(&record(ts, 0)).unwrap();
        }
        flush(&fnp);

        fnp.update("root.sg.d1", "s1", 2, 100, Value::Int64(9)).unwrap();
        let values: Vec<_> = read(&fnp, None).into_iter().map(|(_, v)| v).collect();
        assert_eq!(
            values,
            vec![
                Value::Int64(0),
                Value::Int64(9),
                Value::Int64(9),
                Value::Int64(9),
                Value::Int64(9),
            ]
        );
        assert!(fnp
            .update("root.sg.d1", "s1", 1, 1, Value::Boolean(true))
            .is_err());
    }

    #[test]
    fn test_merge_folds_overflow_into_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let fnp = Arc::new(FileNodeProcessor::open("root.sg", &ctx).unwrap());
        for ts in [10, 20, 30] {
            fnp.insert(&record(ts, 1)).unwrap();
        }
        flush(&fnp);
        fnp.insert(&record(15, 2)).unwrap();
        fnp.insert(&record(20, 2)).unwrap();
        let before = read(&fnp, None);

        let open_file = fnp
            .query("root.sg.d1", "s1")
            .unwrap()
            .seq
            .unsealed
            .unwrap()
            .path;

        // a running query keeps the replaced files alive
        let token = fnp.begin_query();
        fnp.submit_to_merge().unwrap().unwrap().wait().unwrap();
        assert!(!fnp.is_overflowed());
        assert_eq!(fnp.stats().overflow_files, 0);
        assert_eq!(fnp.sealed_files().len(), 1);
        assert_eq!(read(&fnp, None), before);
        assert!(open_file.exists());
        assert_ne!(fnp.sealed_files()[0].path, open_file);

        fnp.end_query(token).unwrap();
        assert!(!open_file.exists());
        assert!(fnp.submit_to_merge().unwrap().is_none());
    }

    #[test]
    fn test_recovery_replays_wal() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        {
            let fnp = FileNodeProcessor::open("root.sg", &ctx).unwrap();
            fnp.insert(&record(10, 1)).unwrap();
            flush(&fnp);
            fnp.insert(&record(20, 1)).unwrap();
            fnp.insert(&record(5, 2)).unwrap();
            fnp.delete("root.sg.d1", "s1", 5).unwrap();
            fnp.insert(&record(7, 3)).unwrap();
            // dropped without close
        }
        let ctx = context(&temp_dir);
        let fnp = FileNodeProcessor::open("root.sg", &ctx).unwrap();
        assert_eq!(fnp.last_update_time("root.sg.d1"), Some(20));
        assert_eq!(
            read(&fnp, None),
            vec![
                (7, Value::Int64(3)),
                (10, Value::Int64(1)),
                (20, Value::Int64(1)),
            ]
        );
        assert_eq!(fnp.memory_usage(), 0);
    }

    #[test]
    fn test_close_and_delete_data() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        {
            let fnp = FileNodeProcessor::open("root.sg", &ctx).unwrap();
            fnp.insert(&record(1, 1)).unwrap();

            let token = fnp.begin_query();
            assert!(matches!(fnp.delete_data(), Err(TesseraError::Busy(_))));
            fnp.end_query(token).unwrap();
            assert!(fnp.end_query(token).is_err());

            fnp.close().unwrap();
            fnp.close().unwrap();
            assert!(matches!(fnp.insert(&record(2, 1)), Err(TesseraError::Closed(_))));
        }

        let reopened = FileNodeProcessor::open("root.sg", &ctx).unwrap();
        assert_eq!(reopened.sealed_files().len(), 1);
        reopened.delete_data().unwrap();
        assert!(!ctx.config.sequence_dir("root.sg").exists());
        assert!(!ctx.config.wal_dir("root.sg-bufferwrite").exists());
    }
}
