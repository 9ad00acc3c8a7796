//! In-order write path: one open file fed by a double-buffered memtable
//!
//! New points go to the work memtable. A flush freezes it into the flush slot
//! and a fresh table takes its place; the frozen table is serialized on the
//! flush pool while writes and queries continue. The slots are guarded by a
//! dedicated lock that is held only for the swap and for assembling query
//! views, never for the serialization itself.

use super::processor::{FlushListener, Processor};
use super::EngineContext;
use crate::memcontrol::{MemController, UsageLevel};
use crate::memtable::{MemTable, ReadOnlyMemChunk};
use crate::pool::{TaskFuture, WorkerPool};
use crate::tsfile::{series_chunks, ChunkGroupMetadata, ChunkMetadata, TsFileWriter};
use crate::version::VersionController;
use crate::wal::WriteLogNode;
use crate::{Result, TesseraError, Timestamp, TsRecord};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct MemTableSlots {
    work: Arc<MemTable>,
    flush: Option<Arc<MemTable>>,
    // cleared table kept for the next swap
    spare: Option<MemTable>,
    // chunk groups durable in the open file
    flushed: Vec<ChunkGroupMetadata>,
}

type ErrorSlot = Arc<Mutex<Option<Arc<TesseraError>>>>;

/// Buffer-write processor of one open file
pub struct BufferWriteProcessor {
    name: String,
    path: PathBuf,
    slots: Arc<Mutex<MemTableSlots>>,
    writer: Arc<Mutex<TsFileWriter>>,
    file_size: Arc<AtomicU64>,
    mem_size: Arc<AtomicU64>,
    mem_threshold: u64,
    version: Arc<dyn VersionController>,
    mem: Arc<MemController>,
    pool: Arc<WorkerPool>,
    listener: Arc<dyn FlushListener>,
    wal: Option<Arc<WriteLogNode>>,
    last_flush: TaskFuture<()>,
    last_error: ErrorSlot,
    closed: bool,
}

impl BufferWriteProcessor {
    /// Open (or reopen after a restart) the file at `path`
    pub fn open(
        name: &str,
        path: impl AsRef<Path>,
        ctx: &EngineContext,
        version: Arc<dyn VersionController>,
        listener: Arc<dyn FlushListener>,
        wal: Option<Arc<WriteLogNode>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = TsFileWriter::open(&path, ctx.tsfile_config())?;
        let slots = MemTableSlots {
            flushed: writer.chunk_groups().to_vec(),
            ..Default::default()
        };
        let file_size = writer.position();
        debug!("Opened buffer-write processor {} on {:?}", name, path);

        Ok(Self {
            name: name.to_string(),
            path,
            slots: Arc::new(Mutex::new(slots)),
            writer: Arc::new(Mutex::new(writer)),
            file_size: Arc::new(AtomicU64::new(file_size)),
            mem_size: Arc::new(AtomicU64::new(0)),
            mem_threshold: ctx.config.memtable_size_threshold,
            version,
            mem: ctx.mem.clone(),
            pool: ctx.flush_pool.clone(),
            listener,
            wal,
            last_flush: TaskFuture::ready(()),
            last_error: Arc::new(Mutex::new(None)),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the open file, durable chunk groups only
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_flushing(&self) -> bool {
        self.slots.lock().flush.is_some()
    }

    /// Points in the work memtable
    pub fn value_count(&self) -> usize {
        self.slots.lock().work.value_count()
    }

    /// Append a record to the work memtable.
    ///
    /// Memory admission decides what happens next: a safe write flushes only
    /// past the memtable threshold, a warning write always flushes, and a
    /// dangerous write is rejected without touching the memtable.
    pub fn write(&mut self, record: &TsRecord) -> Result<()> {
        let level = self.reserve(record)?;
        self.write_reserved(record, level)
    }

    /// Hold the memory of `record` ahead of its write. A dangerous level
    /// rejects the record and holds nothing.
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

    /// Give back a reservation whose record was never written
    pub fn cancel(&self, record: &TsRecord) {
        self.mem.release_usage(&self.name, record.estimated_size());
    }

    /// Apply a record whose memory was reserved at `level`
    pub fn write_reserved(&mut self, record: &TsRecord, level: UsageLevel) -> Result<()> {
        let bytes = record.estimated_size();
        if self.closed {
            self.mem.release_usage(&self.name, bytes);
            return Err(TesseraError::Closed(self.name.clone()));
        }
        let work = self.slots.lock().work.clone();
        if let Err(e) = work.write(record) {
            self.mem.release_usage(&self.name, bytes);
            return Err(e);
        }
        let mem_size = self.mem_size.fetch_add(bytes, Ordering::SeqCst) + bytes;

        if level == UsageLevel::Warning || mem_size > self.mem_threshold {
            // the write itself is durable in the memtable; a failing flush
            // is reported on the next close
            if let Err(e) = self.flush() {
                error!("Flush of {} after write failed: {}", self.name, e);
                *self.last_error.lock() = Some(Arc::new(e));
            }
        }
        Ok(())
    }

    /// Re-apply a logged record during recovery. Admission is not enforced
    /// and no flush is triggered; the caller flushes once replay is done.
    pub fn replay(&mut self, record: &TsRecord) -> Result<()> {
        if self.closed {
            return Err(TesseraError::Closed(self.name.clone()));
        }
        let work = self.slots.lock().work.clone();
        work.write(record)?;
        let bytes = record.estimated_size();
        self.mem.acquire_usage(&self.name, bytes);
        self.mem_size.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    /// Work and flushing memtable view of a series plus its chunks already
    /// durable in the open file
    pub fn query(
        &self,
        device: &str,
        measurement: &str,
    ) -> (Option<ReadOnlyMemChunk>, Vec<ChunkMetadata>) {
        let slots = self.slots.lock();
        let mut data_type = None;
        let mut sources = Vec::with_capacity(2);
        let tables = slots.flush.iter().chain(std::iter::once(&slots.work));
        for table in tables {
            if let Some(series) = table.query(device, measurement) {
                data_type = Some(series.data_type);
                sources.push(series.points);
            }
        }
        let chunk = data_type
            .map(|t| ReadOnlyMemChunk::new(t, sources))
            .filter(|c| !c.is_empty());
        (chunk, series_chunks(&slots.flushed, device, measurement))
    }

    /// Delete points of a series at or before `timestamp` from memory.
    ///
    /// A flushing table is copied before it is modified: the flush task and
    /// running queries keep reading the original.
    pub fn delete(&mut self, device: &str, measurement: &str, timestamp: Timestamp) -> usize {
        let mut slots = self.slots.lock();
        let mut removed = slots.work.delete(device, measurement, timestamp);
        let copy = slots
            .flush
            .as_ref()
            .filter(|f| f.data_type(device, measurement).is_some())
            .map(|f| f.copy());
        if let Some(copy) = copy {
            removed += copy.delete(device, measurement, timestamp);
            slots.flush = Some(Arc::new(copy));
        }
        removed
    }

    /// Chunk groups durable in the open file
    pub fn chunk_groups(&self) -> Vec<ChunkGroupMetadata> {
        self.slots.lock().flushed.clone()
    }

    /// Block until the most recent flush has finished
    pub fn wait_for_flush(&self) -> Result<()> {
        self.last_flush.wait()
    }

    fn take_error(&self) -> Option<Arc<TesseraError>> {
        self.last_error.lock().take()
    }
}

impl Processor for BufferWriteProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn flush(&mut self) -> Result<TaskFuture<()>> {
        if self.closed {
            return Err(TesseraError::Closed(self.name.clone()));
        }
        // one flush at a time; a failure was already stashed by the task
        if let Err(e) = self.last_flush.wait() {
            debug!("Previous flush of {} failed: {}", self.name, e);
        }

        if self.slots.lock().work.is_empty() {
            return Ok(TaskFuture::ready(()));
        }

        let version = self.version.next_version()?;
        self.listener.on_flush_start()?;
        if let Some(wal) = &self.wal {
            wal.notify_start_flush()?;
        }

        let frozen = {
            let mut slots = self.slots.lock();
            let fresh = slots.spare.take().unwrap_or_default();
            let frozen = std::mem::replace(&mut slots.work, Arc::new(fresh));
            slots.flush = Some(frozen.clone());
            frozen
        };
        let bytes = self.mem_size.swap(0, Ordering::SeqCst);
        self.mem.release_usage(&self.name, bytes);
        info!(
            "Flushing {} points of {} at version {}",
            frozen.value_count(),
            self.name,
            version
        );

        let task = FlushTask {
            name: self.name.clone(),
            slots: self.slots.clone(),
            writer: self.writer.clone(),
            file_size: self.file_size.clone(),
            mem_size: self.mem_size.clone(),
            mem: self.mem.clone(),
            listener: self.listener.clone(),
            wal: self.wal.clone(),
            last_error: self.last_error.clone(),
        };
        let future = self.pool.submit(move || task.run(frozen, version, bytes));
        self.last_flush = future.clone();
        Ok(future)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let future = self.flush()?;
        future.wait()?;

        {
            let mut writer = self.writer.lock();
            writer.end_file()?;
            self.file_size.store(writer.position(), Ordering::SeqCst);
        }
        {
            let mut slots = self.slots.lock();
            slots.work = Arc::new(MemTable::new());
            slots.flush = None;
            slots.spare = None;
        }
        let bytes = self.mem_size.swap(0, Ordering::SeqCst);
        self.mem.release_usage(&self.name, bytes);
        self.closed = true;
        info!("Closed buffer-write file {:?}", self.path);

        self.listener.on_close()?;
        match self.take_error() {
            Some(e) => Err(TesseraError::Task(e)),
            None => Ok(()),
        }
    }

    fn memory_usage(&self) -> u64 {
        self.mem_size.load(Ordering::SeqCst)
    }

    fn can_be_closed(&self) -> bool {
        true
    }
}

struct FlushTask {
    name: String,
    slots: Arc<Mutex<MemTableSlots>>,
    writer: Arc<Mutex<TsFileWriter>>,
    file_size: Arc<AtomicU64>,
    mem_size: Arc<AtomicU64>,
    mem: Arc<MemController>,
    listener: Arc<dyn FlushListener>,
    wal: Option<Arc<WriteLogNode>>,
    last_error: ErrorSlot,
}

impl FlushTask {
    fn run(self, frozen: Arc<MemTable>, version: u64, bytes: u64) -> Result<()> {
        match self.write(&frozen, version) {
            Ok(groups) => {
                {
                    let mut slots = self.slots.lock();
                    slots.flushed.extend(groups.iter().cloned());
                    slots.flush = None;
                    // reuse the table once no query holds it
                    if let Ok(mut table) = Arc::try_unwrap(frozen) {
                        table.clear();
                        slots.spare = Some(table);
                    }
                }
                if let Err(e) = self.listener.on_flush_end(&groups) {
                    error!("Flush listener of {} failed: {}", self.name, e);
                    *self.last_error.lock() = Some(Arc::new(e));
                }
                if let Some(wal) = &self.wal {
                    wal.notify_end_flush(true)?;
                }
                info!("Flushed {} chunk groups of {}", groups.len(), self.name);
                Ok(())
            }
            Err(e) => {
                error!("Flush of {} failed: {}", self.name, e);
                {
                    let mut slots = self.slots.lock();
                    // a delete during the flush swapped in a pruned copy
                    let pending = slots.flush.take().unwrap_or(frozen);
                    // newer writes shadow the frozen points
                    slots.work.absorb(&pending);
                }
                self.mem.acquire_usage(&self.name, bytes);
                self.mem_size.fetch_add(bytes, Ordering::SeqCst);
                if let Some(wal) = &self.wal {
                    if let Err(wal_error) = wal.notify_end_flush(false) {
                        warn!("Log node of {} not notified: {}", self.name, wal_error);
                    }
                }
                let e = Arc::new(e);
                *self.last_error.lock() = Some(e.clone());
                Err(TesseraError::Task(e))
            }
        }
    }

    fn write(&self, frozen: &MemTable, version: u64) -> Result<Vec<ChunkGroupMetadata>> {
        let mut writer = self.writer.lock();
        let result = frozen
            .snapshot()
            .into_iter()
            .map(|(device, series)| writer.write_chunk_group(&device, version, series))
            .collect::<Result<Vec<_>>>()
            .and_then(|groups| writer.flush().map(|_| groups));
        if result.is_err() {
            if let Err(e) = writer.rollback() {
                error!("Rollback of {:?} failed: {}", writer.path(), e);
            }
        }
        self.file_size.store(writer.position(), Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::version::SimpleFileVersionController;
    use crate::wal::WalConfig;
    use crate::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingListener {
        started: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        ended: AtomicUsize,
        closed: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FlushListener for CountingListener {
        fn on_flush_start(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_flush_end(&self, _groups: &[ChunkGroupMetadata]) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.ended.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(dir: &TempDir, threshold: u64) -> EngineContext {
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.memtable_size_threshold = threshold;
        config.concurrent_flush_threads = 4;
        EngineContext::new(config).unwrap()
    }

    fn processor(
        dir: &TempDir,
        ctx: &EngineContext,
        listener: Arc<CountingListener>,
    ) -> BufferWriteProcessor {
        let version = Arc::new(SimpleFileVersionController::open(dir.path().join("system")).unwrap());
        BufferWriteProcessor::open(
            "root.sg-bufferwrite",
            dir.path().join("sequence").join("1-1.tsfile"),
            ctx,
            version,
            listener,
            None,
        )
        .unwrap()
    }

    fn record(ts: i64) -> TsRecord {
        TsRecord::new("root.sg.d1", ts).with_point("s1", ts)
    }

    fn times(bwp: &BufferWriteProcessor) -> (Vec<i64>, usize) {
        let (chunk, chunks) = bwp.query("root.sg.d1", "s1");
        let mem = chunk
            .map(|c| c.into_points(false).map(|p| p.timestamp).collect())
            .unwrap_or_default();
        (mem, chunks.len())
    }

    #[test]
    fn test_flush_moves_points_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        let listener = Arc::new(CountingListener::default());
        let mut bwp = processor(&temp_dir, &ctx, listener.clone());

        for ts in 1..=10 {
            bwp.write(&record(ts)).unwrap();
        }
        assert_eq!(times(&bwp), ((1..=10).collect(), 0));
        assert!(bwp.memory_usage() > 0);

        bwp.flush().unwrap().wait().unwrap();
        assert_eq!(times(&bwp), (vec![], 1));
        assert_eq!(bwp.memory_usage(), 0);
        assert_eq!(ctx.mem.usage_of("root.sg-bufferwrite"), 0);
        assert_eq!(listener.started.load(Ordering::SeqCst), 1);
        assert_eq!(listener.ended.load(Ordering::SeqCst), 1);
        assert!(bwp.file_size() > crate::tsfile::HEADER_SIZE);
    }

    #[test]
    fn test_empty_flush_is_ready() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        let listener = Arc::new(CountingListener::default());
        let mut bwp = processor(&temp_dir, &ctx, listener.clone());

        let future = bwp.flush().unwrap();
        assert!(future.is_done());
        assert_eq!(listener.started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_threshold_triggers_flush() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, 1);
        let listener = Arc::new(CountingListener::default());
        let mut bwp = processor(&temp_dir, &ctx, listener.clone());

        bwp.write(&record(1)).unwrap();
        bwp.wait_for_flush().unwrap();
        assert_eq!(listener.ended.load(Ordering::SeqCst), 1);
        assert_eq!(bwp.value_count(), 0);
    }

    #[test]
    fn test_dangerous_write_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_data_dir(temp_dir.path());
        config.mem_warning_threshold = 10;
        config.mem_dangerous_threshold = 20;
        let ctx = EngineContext::new(config).unwrap();
        let mut bwp = processor(&temp_dir, &ctx, Arc::new(CountingListener::default()));

        let big = TsRecord::new("root.sg.d1", 1).with_point("s1", "x".repeat(64).as_str());
        assert!(matches!(bwp.write(&big), Err(TesseraError::Rejected(_))));
        assert_eq!(bwp.value_count(), 0);
        assert_eq!(ctx.mem.total_usage(), 0);
    }

    #[test]
    fn test_at_most_one_flush_in_flight() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        let listener = Arc::new(CountingListener {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let mut bwp = processor(&temp_dir, &ctx, listener.clone());

        for round in 0..8 {
            bwp.write(&record(round)).unwrap();
            bwp.flush().unwrap();
        }
        bwp.wait_for_flush().unwrap();

        assert_eq!(listener.ended.load(Ordering::SeqCst), 8);
        assert_eq!(listener.max_in_flight.load(Ordering::SeqCst), 1);
        let (_, chunks) = bwp.query("root.sg.d1", "s1");
        assert_eq!(chunks.len(), 8);
    }

    #[test]
    fn test_delete_during_flush_copies_frozen_table() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        let mut bwp = processor(&temp_dir, &ctx, Arc::new(CountingListener::default()));

        for ts in 0..10 {
            bwp.write(&record(ts)).unwrap();
        }
        // a query view taken before the flush starts
        let (before, _) = bwp.query("root.sg.d1", "s1");

        // hold the writer so the flush task cannot finish
        let writer = bwp.writer.clone();
        let held = writer.lock();
        let future = bwp.flush().unwrap();
        bwp.write(&record(20)).unwrap();

        let frozen = bwp.slots.lock().flush.clone().unwrap();
        let removed = bwp.delete("root.sg.d1", "s1", 4);
        assert_eq!(removed, 5);
        assert_eq!(frozen.value_count(), 10);
        assert_eq!(times(&bwp).0, vec![5, 6, 7, 8, 9, 20]);

        drop(held);
        future.wait().unwrap();
        drop(frozen);

        let before: Vec<i64> = before.unwrap().into_points(false).map(|p| p.timestamp).collect();
        assert_eq!(before, (0..10).collect::<Vec<_>>());
        assert_eq!(times(&bwp).0, vec![20]);
    }

    #[test]
    fn test_failed_flush_keeps_deletes_made_during_it() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        let mut bwp = processor(&temp_dir, &ctx, Arc::new(CountingListener::default()));
        for ts in 0..10 {
            bwp.write(&record(ts)).unwrap();
        }

        let writer = bwp.writer.clone();
        let held = writer.lock();
        let future = bwp.flush().unwrap();
        assert_eq!(bwp.delete("root.sg.d1", "s1", 4), 5);

        // the restore state cannot be written, so the flush fails
        let mut tmp = crate::tsfile::restore_path(bwp.path()).into_os_string();
        tmp.push(".tmp");
        std::fs::create_dir(&tmp).unwrap();
        drop(held);
        assert!(future.wait().is_err());

        assert!(!bwp.is_flushing());
        assert_eq!(times(&bwp), ((5..10).collect(), 0));
        assert!(bwp.memory_usage() > 0);
    }

    #[test]
    fn test_readers_see_sorted_views_across_swap() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        let mut bwp = processor(&temp_dir, &ctx, Arc::new(CountingListener::default()));
        for ts in 0..100 {
            bwp.write(&record(ts)).unwrap();
        }
        let writer = bwp.writer.clone();
        let bwp = Arc::new(parking_lot::RwLock::new(bwp));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let bwp = bwp.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut views = 0;
                loop {
                    let (mem, _) = times(&bwp.read());
                    // deletes cut a prefix, the flush empties memory
                    if let Some(&first) = mem.first() {
                        assert_eq!(mem, (first..100).collect::<Vec<_>>());
                    }
                    views += 1;
                    if stop.load(Ordering::SeqCst) {
                        return views;
                    }
                }
            })
        };

        let held = writer.lock();
        let future = bwp.write().flush().unwrap();
        for cut in [9, 19, 29, 39] {
            assert_eq!(bwp.write().delete("root.sg.d1", "s1", cut), 10);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(times(&bwp.read()).0, (40..100).collect::<Vec<_>>());
        drop(held);
        future.wait().unwrap();

        stop.store(true, Ordering::SeqCst);
        assert!(reader.join().unwrap() > 0);
        assert_eq!(times(&bwp.read()), (vec![], 1));
    }

    #[test]
    fn test_close_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        let listener = Arc::new(CountingListener::default());
        let mut bwp = processor(&temp_dir, &ctx, listener.clone());
        bwp.write(&record(1)).unwrap();

        bwp.close().unwrap();
        bwp.close().unwrap();
        assert!(bwp.is_closed());
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
        assert_eq!(listener.ended.load(Ordering::SeqCst), 1);
        assert!(crate::tsfile::TsFileReader::is_sealed(bwp.path()).unwrap());
        assert!(matches!(bwp.write(&record(2)), Err(TesseraError::Closed(_))));
    }

    #[test]
    fn test_reopen_recovers_flushed_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        {
            let mut bwp = processor(&temp_dir, &ctx, Arc::new(CountingListener::default()));
            bwp.write(&record(1)).unwrap();
            bwp.flush().unwrap().wait().unwrap();
            bwp.write(&record(2)).unwrap();
            // dropped without close: point 2 lives only in memory
        }
        let bwp = processor(&temp_dir, &ctx, Arc::new(CountingListener::default()));
        assert_eq!(times(&bwp), (vec![], 1));
        assert_eq!(bwp.chunk_groups()[0].chunks[0].count, 1);
    }

    #[test]
    fn test_flush_notifies_wal() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir, u64::MAX);
        let wal = Arc::new(
            WriteLogNode::open(
                "root.sg-bufferwrite",
                WalConfig {
                    dir: temp_dir.path().join("wal"),
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let version = Arc::new(SimpleFileVersionController::open(temp_dir.path()).unwrap());
        let mut bwp = BufferWriteProcessor::open(
            "root.sg-bufferwrite",
            temp_dir.path().join("1-1.tsfile"),
            &ctx,
            version,
            Arc::new(CountingListener::default()),
            Some(wal.clone()),
        )
        .unwrap();

        let first = record(1);
        wal.write(&crate::wal::LogRecord::Insert(first.clone())).unwrap();
        bwp.write(&first).unwrap();
        bwp.flush().unwrap().wait().unwrap();

        let second = TsRecord::new("root.sg.d1", 2).with_point("s1", Value::Int64(2));
        wal.write(&crate::wal::LogRecord::Insert(second.clone())).unwrap();
        assert_eq!(wal.recover().unwrap(), vec![crate::wal::LogRecord::Insert(second)]);
    }
}
