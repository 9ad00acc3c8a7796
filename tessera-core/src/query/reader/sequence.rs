//! Ordered reader over the in-order data of one series

use super::{BatchReader, FileSeriesReader, MemChunkReader, SealedTsFilesReader, BATCH_SIZE};
use crate::modification::apply_deletions;
use crate::query::filter::Filter;
use crate::query::{GlobalSortedSeriesDataSource, QueryContext};
use crate::{BatchData, Result, TimeValuePair, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;

/// Chains sealed files, the open file and the memtable view of a series.
///
/// Forward mode reads sealed files oldest first, then the open file, then
/// memory; reverse mode reads memory first and ends with the oldest sealed
/// file. A timestamp present in two consecutive sources is reported once,
/// with the value of the newer source.
pub struct SequenceDataReader {
    readers: VecDeque<Box<dyn BatchReader>>,
    raw: VecDeque<TimeValuePair>,
    reverse: bool,
    // forward: newest point seen for the timestamp under inspection
    held: Option<TimeValuePair>,
    // reverse: timestamp of the last point handed out
    last_emitted: Option<Timestamp>,
    next: Option<TimeValuePair>,
}

impl SequenceDataReader {
    pub fn new(
        source: GlobalSortedSeriesDataSource,
        filter: Option<Filter>,
        ctx: Arc<QueryContext>,
        reverse: bool,
    ) -> Result<Self> {
        let mut readers: Vec<Box<dyn BatchReader>> = Vec::with_capacity(3);
        if !source.sealed.is_empty() {
            readers.push(Box::new(SealedTsFilesReader::new(
                source.path.clone(),
                source.sealed,
                filter.clone(),
                ctx.clone(),
                reverse,
            )));
        }
        if let Some(unsealed) = source.unsealed {
            let mut chunks = unsealed.chunks;
            let deletions = ctx.series_modifications(&unsealed.path, &source.path)?;
            apply_deletions(&mut chunks, &deletions);
            if !chunks.is_empty() {
                readers.push(Box::new(FileSeriesReader::new(
                    unsealed.path,
                    chunks,
                    filter.clone(),
                    reverse,
                )));
            }
        }
        if let Some(mem) = source.mem {
            readers.push(Box::new(MemChunkReader::new(mem, filter, reverse)));
        }
        if reverse {
            readers.reverse();
        }
        Ok(Self::from_readers(readers, reverse))
    }

    /// Chain readers given in traversal order
    pub fn from_readers(readers: Vec<Box<dyn BatchReader>>, reverse: bool) -> Self {
        Self {
            readers: readers.into(),
            raw: VecDeque::new(),
            reverse,
            held: None,
            last_emitted: None,
            next: None,
        }
    }

    fn next_raw(&mut self) -> Result<Option<TimeValuePair>> {
        while self.raw.is_empty() {
            let Some(reader) = self.readers.front_mut() else {
                return Ok(None);
            };
            if reader.has_next()? {
                self.raw.extend(reader.next_batch()?);
            } else {
                reader.close();
                self.readers.pop_front();
            }
        }
        Ok(self.raw.pop_front())
    }

    fn next_point(&mut self) -> Result<Option<TimeValuePair>> {
        if self.reverse {
            while let Some(point) = self.next_raw()? {
                if self.last_emitted != Some(point.timestamp) {
                    self.last_emitted = Some(point.timestamp);
                    return Ok(Some(point));
                }
            }
            return Ok(None);
        }
        loop {
            let Some(point) = self.next_raw()? else {
                return Ok(self.held.take());
            };
            match self.held.replace(point) {
                Some(previous) if previous.timestamp != self.held_time() => {
                    return Ok(Some(previous));
                }
                _ => {}
            }
        }
    }

    fn held_time(&self) -> Timestamp {
        self.held.as_ref().map_or(Timestamp::MIN, |p| p.timestamp)
    }
}

impl BatchReader for SequenceDataReader {
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
        for reader in self.readers.iter_mut() {
            reader.close();
        }
        self.readers.clear();
        self.raw.clear();
        self.held = None;
        self.next = None;
    }
}
