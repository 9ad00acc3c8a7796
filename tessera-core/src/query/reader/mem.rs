//! Reader over the memtable view of a series

use super::{BatchReader, BATCH_SIZE};
use crate::memtable::{MemChunkIter, ReadOnlyMemChunk};
use crate::query::filter::{accepts, Filter};
use crate::{BatchData, Result};
use std::iter::Peekable;

pub struct MemChunkReader {
    points: Peekable<MemChunkIter>,
    filter: Option<Filter>,
}

impl MemChunkReader {
    pub fn new(chunk: ReadOnlyMemChunk, filter: Option<Filter>, reverse: bool) -> Self {
        Self {
            points: chunk.into_points(reverse).peekable(),
            filter,
        }
    }
}

impl BatchReader for MemChunkReader {
    fn has_next(&mut self) -> Result<bool> {
        while let Some(point) = self.points.peek() {
            if accepts(self.filter.as_ref(), point) {
                return Ok(true);
            }
            self.points.next();
        }
        Ok(false)
    }

    fn next_batch(&mut self) -> Result<BatchData> {
        let mut batch = Vec::with_capacity(BATCH_SIZE.min(64));
        while batch.len() < BATCH_SIZE {
            match self.points.next() {
                Some(point) if accepts(self.filter.as_ref(), &point) => batch.push(point),
                Some(_) => {}
                None => break,
            }
        }
        Ok(batch)
    }
}
