//! Read-only view of one series across the flushing and working memtables

use crate::{DataType, TimeValuePair, Timestamp};

/// Sorted snapshots of a series from several memtables, oldest first.
///
/// The snapshots are merged lazily while iterating; when two snapshots hold
/// the same timestamp the newer one wins.
#[derive(Debug, Clone)]
pub struct ReadOnlyMemChunk {
    data_type: DataType,
    sources: Vec<Vec<TimeValuePair>>,
}

impl ReadOnlyMemChunk {
    pub fn new(data_type: DataType, sources: Vec<Vec<TimeValuePair>>) -> Self {
        let sources = sources.into_iter().filter(|s| !s.is_empty()).collect();
        Self { data_type, sources }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Upper bound of the number of points (duplicates counted per source)
    pub fn len_hint(&self) -> usize {
        self.sources.iter().map(Vec::len).sum()
    }

    pub fn min_time(&self) -> Option<Timestamp> {
        self.sources.iter().filter_map(|s| s.first()).map(|p| p.timestamp).min()
    }

    pub fn max_time(&self) -> Option<Timestamp> {
        self.sources.iter().filter_map(|s| s.last()).map(|p| p.timestamp).max()
    }

    /// Merged points in ascending or descending time order
    pub fn into_points(self, reverse: bool) -> MemChunkIter {
        let cursors = self
            .sources
            .iter()
            .map(|s| if reverse { s.len() } else { 0 })
            .collect();
        MemChunkIter {
            sources: self.sources,
            cursors,
            reverse,
        }
    }

    /// Merged points in ascending order
    pub fn sorted_points(&self) -> Vec<TimeValuePair> {
        self.clone().into_points(false).collect()
    }
}

/// Lazy k-way merge over the snapshots of a [`ReadOnlyMemChunk`]
pub struct MemChunkIter {
    sources: Vec<Vec<TimeValuePair>>,
    // forward: next index to read; reverse: one past the next index
    cursors: Vec<usize>,
    reverse: bool,
}

impl MemChunkIter {
    fn head(&self, source: usize) -> Option<Timestamp> {
        let cursor = self.cursors[source];
        let points = &self.sources[source];
        if self.reverse {
            cursor.checked_sub(1).map(|i| points[i].timestamp)
        } else {
            points.get(cursor).map(|p| p.timestamp)
        }
    }

    fn advance(&mut self, source: usize) {
        if self.reverse {
            self.cursors[source] -= 1;
        } else {
            self.cursors[source] += 1;
        }
    }
}

impl Iterator for MemChunkIter {
    type Item = TimeValuePair;

    fn next(&mut self) -> Option<TimeValuePair> {
        let mut best: Option<(usize, Timestamp)> = None;
        for source in 0..self.sources.len() {
            let Some(ts) = self.head(source) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((_, best_ts)) if self.reverse => ts >= best_ts,
                Some((_, best_ts)) => ts <= best_ts,
            };
            // later sources are newer, so ties move the pick forward
            if better {
                best = Some((source, ts));
            }
        }

        let (winner, ts) = best?;
        let index = if self.reverse {
            self.cursors[winner] - 1
        } else {
            self.cursors[winner]
        };
        let point = self.sources[winner][index].clone();
        for source in 0..self.sources.len() {
            if self.head(source) == Some(ts) {
                self.advance(source);
            }
        }
        Some(point)
    }
}
