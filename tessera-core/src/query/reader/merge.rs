//! Priority merge of in-order and out-of-order sources

use super::{
    BatchReader, MemChunkReader, PointCursor, SealedTsFilesReader, SequenceDataReader, BATCH_SIZE,
};
use crate::query::filter::{accepts, Filter};
use crate::query::{QueryContext, QueryDataSource};
use crate::{BatchData, Result, TimeValuePair, Timestamp};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    timestamp: Timestamp,
    priority: usize,
    source: usize,
    reverse: bool,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: smallest timestamp on top going forward, largest in reverse
        let by_time = if self.reverse {
            self.timestamp.cmp(&other.timestamp)
        } else {
            other.timestamp.cmp(&self.timestamp)
        };
        by_time.then(self.priority.cmp(&other.priority))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge by timestamp; on equal timestamps the source with the
/// highest priority wins and the others are skipped
pub struct PriorityMergeReader {
    sources: Vec<PointCursor>,
    priorities: Vec<usize>,
    heap: BinaryHeap<HeapEntry>,
    reverse: bool,
}

impl PriorityMergeReader {
    pub fn new(reverse: bool) -> Self {
        Self {
            sources: Vec::new(),
            priorities: Vec::new(),
            heap: BinaryHeap::new(),
            reverse,
        }
    }

    /// Add a source; each source must be strictly ordered in the merge direction
    pub fn add_reader(&mut self, reader: Box<dyn BatchReader>, priority: usize) -> Result<()> {
        let source = self.sources.len();
        self.sources.push(PointCursor::new(reader));
        self.priorities.push(priority);
        self.push_head(source)
    }

    fn push_head(&mut self, source: usize) -> Result<()> {
        if let Some(point) = self.sources[source].peek()? {
            self.heap.push(HeapEntry {
                timestamp: point.timestamp,
                priority: self.priorities[source],
                source,
                reverse: self.reverse,
            });
        }
        Ok(())
    }

    pub fn next_point(&mut self) -> Result<Option<TimeValuePair>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        let point = self.sources[top.source].next_point()?;
        self.push_head(top.source)?;

        while self
            .heap
            .peek()
            .is_some_and(|next| next.timestamp == top.timestamp)
        {
            if let Some(shadowed) = self.heap.pop() {
                self.sources[shadowed.source].next_point()?;
                self.push_head(shadowed.source)?;
            }
        }
        Ok(point)
    }
}

impl BatchReader for PriorityMergeReader {
    fn has_next(&mut self) -> Result<bool> {
        Ok(!self.heap.is_empty())
    }

    fn next_batch(&mut self) -> Result<BatchData> {
        let mut batch = Vec::new();
        while batch.len() < BATCH_SIZE {
            match self.next_point()? {
                Some(point) => batch.push(point),
                None => break,
            }
        }
        Ok(batch)
    }

    fn close(&mut self) {
        for source in self.sources.iter_mut() {
            source.close();
        }
        self.heap.clear();
    }
}

/// Final ordered stream of one series: sequence data overridden by overflow
/// data, newer overflow files over older ones and the overflow memtable over
/// everything. Only the time part of the filter reaches the inner readers;
/// the full filter is applied to the merged points.
pub struct SeriesReader {
    merge: PriorityMergeReader,
    filter: Option<Filter>,
    next: Option<TimeValuePair>,
}

impl SeriesReader {
    pub fn new(
        source: QueryDataSource,
        filter: Option<Filter>,
        ctx: Arc<QueryContext>,
        reverse: bool,
    ) -> Result<Self> {
        let time_filter = filter.as_ref().and_then(Filter::time_component);
        let mut merge = PriorityMergeReader::new(reverse);

        let seq = SequenceDataReader::new(source.seq, time_filter.clone(), ctx.clone(), reverse)?;
        merge.add_reader(Box::new(seq), 0)?;

        let overflow = source.overflow;
        let mut priority = 1;
        for file in overflow.files {
            let reader = SealedTsFilesReader::new(
                overflow.path.clone(),
                vec![file],
                time_filter.clone(),
                ctx.clone(),
                reverse,
            );
            merge.add_reader(Box::new(reader), priority)?;
            priority += 1;
        }
        if let Some(mem) = overflow.mem {
            merge.add_reader(Box::new(MemChunkReader::new(mem, time_filter, reverse)), priority)?;
        }

        let filter = filter.filter(Filter::has_value_component);
        Ok(Self {
            merge,
            filter,
            next: None,
        })
    }

    fn next_point(&mut self) -> Result<Option<TimeValuePair>> {
        while let Some(point) = self.merge.next_point()? {
            if accepts(self.filter.as_ref(), &point) {
                return Ok(Some(point));
            }
        }
        Ok(None)
    }
}

impl BatchReader for SeriesReader {
    fn has_next(&mut self) -> Result<bool> {
        if self.next.is_none() {
            self.next = self.next_point()?;
        }
        Ok(self.next.is_some())
    }

    fn next_batch(&mut self) -> Result<BatchData> {
        let mut batch = Vec::new();
        if let Some(first) = self.next.take() {
            batch.push(first);
        }
        while batch.len() < BATCH_SIZE {
            match self.next_point()? {
                Some(point) => batch.push(point),
                None => break,
            }
        }
        Ok(batch)
    }

    fn close(&mut self) {
        self.merge.close();
        self.next = None;
    }
}
