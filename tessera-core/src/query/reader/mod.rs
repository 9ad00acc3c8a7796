//! Batch readers over the sources of a series
//!
//! Every reader yields points in ascending time order, or descending when
//! built in reverse mode, as a lazy single-pass sequence of batches.

mod file;
mod mem;
mod merge;
mod sequence;

pub use file::{FileSeriesReader, SealedTsFilesReader};
pub use mem::MemChunkReader;
pub use merge::{PriorityMergeReader, SeriesReader};
pub use sequence::SequenceDataReader;

use crate::{BatchData, Result, TimeValuePair};
use std::collections::VecDeque;

/// Maximum points per batch
pub const BATCH_SIZE: usize = 1024;

/// Lazy, forward-only reader of time-ordered batches
pub trait BatchReader: Send {
    fn has_next(&mut self) -> Result<bool>;

    /// Next non-empty batch; call only after `has_next` returned true
    fn next_batch(&mut self) -> Result<BatchData>;

    /// Release open files
    fn close(&mut self) {}
}

/// Drain a reader into one vector
pub fn read_all(reader: &mut dyn BatchReader) -> Result<Vec<TimeValuePair>> {
    let mut points = Vec::new();
    while reader.has_next()? {
        points.extend(reader.next_batch()?);
    }
    reader.close();
    Ok(points)
}

/// Point-at-a-time view of a batch reader
pub struct PointCursor {
    reader: Box<dyn BatchReader>,
    buffer: VecDeque<TimeValuePair>,
}

impl PointCursor {
    pub fn new(reader: Box<dyn BatchReader>) -> Self {
        Self {
            reader,
            buffer: VecDeque::new(),
        }
    }

    pub fn peek(&mut self) -> Result<Option<&TimeValuePair>> {
        while self.buffer.is_empty() {
            if !self.reader.has_next()? {
                return Ok(None);
            }
            self.buffer.extend(self.reader.next_batch()?);
        }
        Ok(self.buffer.front())
    }

    pub fn next_point(&mut self) -> Result<Option<TimeValuePair>> {
        self.peek()?;
        Ok(self.buffer.pop_front())
    }

    pub fn close(&mut self) {
        self.buffer.clear();
        self.reader.close();
    }
}
