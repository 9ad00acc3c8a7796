//! Time-ordered values of one measurement

use crate::{DataType, TimeRange, TimeValuePair, Timestamp, Value};
use crossbeam_skiplist::SkipMap;

/// Values of one series keyed by timestamp. A second write at the same
/// timestamp replaces the first.
pub struct MemSeries {
    data_type: DataType,
    points: SkipMap<Timestamp, Value>,
}

impl MemSeries {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            points: SkipMap::new(),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Insert a value, returning true if the timestamp was new
    pub fn write(&self, timestamp: Timestamp, value: Value) -> bool {
        let fresh = !self.points.contains_key(&timestamp);
        self.points.insert(timestamp, value);
        fresh
    }

    /// Insert a value only if the timestamp is not present yet
    pub fn write_if_absent(&self, timestamp: Timestamp, value: Value) -> bool {
        let fresh = !self.points.contains_key(&timestamp);
        self.points.get_or_insert(timestamp, value);
        fresh
    }

    /// Remove every point at or before `timestamp`
    pub fn delete_upto(&self, timestamp: Timestamp) -> usize {
        let mut removed = 0;
        for entry in self.points.range(..=timestamp) {
            if entry.remove() {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn min_time(&self) -> Option<Timestamp> {
        self.points.front().map(|e| *e.key())
    }

    pub fn max_time(&self) -> Option<Timestamp> {
        self.points.back().map(|e| *e.key())
    }

    /// Sorted copy of the points
    pub fn sorted_points(&self) -> Vec<TimeValuePair> {
        self.points
            .iter()
            .map(|e| TimeValuePair::new(*e.key(), e.value().clone()))
            .collect()
    }

    /// Sorted copy of the points inside `range`
    pub fn points_in(&self, range: &TimeRange) -> Vec<TimeValuePair> {
        if range.is_empty() {
            return Vec::new();
        }
        self.points
            .range(range.start..=range.end)
            .map(|e| TimeValuePair::new(*e.key(), e.value().clone()))
            .collect()
    }

    /// Deep copy
    pub fn copy(&self) -> Self {
        let copy = Self::new(self.data_type);
        for entry in self.points.iter() {
            copy.points.insert(*entry.key(), entry.value().clone());
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_writes_are_sorted() {
        let series = MemSeries::new(DataType::Int64);
        for ts in [30, 10, 20, 10] {
            series.write(ts, Value::Int64(ts));
        }
        let times: Vec<_> = series.sorted_points().iter().map(|p| p.timestamp).collect();
        assert_eq!(times, vec![10, 20, 30]);
        assert_eq!(series.min_time(), Some(10));
        assert_eq!(series.max_time(), Some(30));
    }

    #[test]
    fn test_delete_upto() {
        let series = MemSeries::new(DataType::Int32);
        for ts in 0..10 {
            series.write(ts, Value::Int32(ts as i32));
        }
        assert_eq!(series.delete_upto(4), 5);
        assert_eq!(series.len(), 5);
        assert_eq!(series.min_time(), Some(5));
        assert_eq!(series.points_in(&TimeRange::new(6, 7)).len(), 2);
    }
}
