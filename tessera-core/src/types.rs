//! Core types for Tessera

use crate::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// A batch of time-ordered points produced by a reader
pub type BatchData = Vec<TimeValuePair>;

/// Data type of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Boolean = 0,
    Int32 = 1,
    Int64 = 2,
    Float = 3,
    Double = 4,
    Text = 5,
}

impl TryFrom<u8> for DataType {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DataType::Boolean),
            1 => Ok(DataType::Int32),
            2 => Ok(DataType::Int64),
            3 => Ok(DataType::Float),
            4 => Ok(DataType::Double),
            5 => Ok(DataType::Text),
            _ => Err(TesseraError::InvalidFormat(format!(
                "Invalid data type: {}",
                value
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Text => "TEXT",
        };
        f.write_str(name)
    }
}

/// A single measurement value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Text(String),
}

impl Value {
    /// Data type carried by this value
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::Text(_) => DataType::Text,
        }
    }

    /// Get the size in bytes
    pub fn size(&self) -> usize {
        match self {
            Value::Boolean(_) => 1,
            Value::Int32(_) | Value::Float(_) => 4,
            Value::Int64(_) | Value::Double(_) => 8,
            Value::Text(s) => s.len(),
        }
    }

    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse a textual value as the given data type
    pub fn parse(data_type: DataType, raw: &str) -> Result<Self> {
        let invalid = |e: &dyn fmt::Display| {
            TesseraError::InvalidValue(format!("{} is not a valid {}: {}", raw, data_type, e))
        };
        let raw = raw.trim();
        Ok(match data_type {
            DataType::Boolean => Value::Boolean(raw.parse().map_err(|e| invalid(&e))?),
            DataType::Int32 => Value::Int32(raw.parse().map_err(|e| invalid(&e))?),
            DataType::Int64 => Value::Int64(raw.parse().map_err(|e| invalid(&e))?),
            DataType::Float => Value::Float(raw.parse().map_err(|e| invalid(&e))?),
            DataType::Double => Value::Double(raw.parse().map_err(|e| invalid(&e))?),
            DataType::Text => Value::Text(raw.to_string()),
        })
    }

    /// Compare two values; numeric types compare across widths
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// One measurement value inside a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Measurement name (last path component)
    pub measurement: String,
    /// Value
    pub value: Value,
}

impl DataPoint {
    /// Create a new data point
    pub fn new(measurement: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            measurement: measurement.into(),
            value: value.into(),
        }
    }
}

/// A per-device, per-timestamp write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsRecord {
    /// Device path, e.g. `root.sg1.d1`
    pub device: String,
    /// Timestamp
    pub timestamp: Timestamp,
    /// Measurement values
    pub points: Vec<DataPoint>,
}

impl TsRecord {
    /// Create an empty record
    pub fn new(device: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            device: device.into(),
            timestamp,
            points: Vec::new(),
        }
    }

    /// Add a measurement value
    pub fn with_point(mut self, measurement: impl Into<String>, value: impl Into<Value>) -> Self {
        self.points.push(DataPoint::new(measurement, value));
        self
    }

    /// Estimated in-memory size, used by memory admission control
    pub fn estimated_size(&self) -> u64 {
        let points: usize = self
            .points
            .iter()
            .map(|p| p.measurement.len() + p.value.size() + 8)
            .sum();
        (self.device.len() + 8 + points) as u64
    }
}

/// A timestamp and its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValuePair {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl TimeValuePair {
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole time axis
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Overlap of two ranges, if any
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let range = TimeRange::new(self.start.max(other.start), self.end.min(other.end));
        if range.is_empty() {
            None
        } else {
            Some(range)
        }
    }

    /// True when start is after end
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Full path of a series, `<device>.<measurement>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesPath {
    pub device: String,
    pub measurement: String,
}

impl SeriesPath {
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
        }
    }

    /// Split a full path on its last dot
    pub fn parse(full: &str) -> Result<Self> {
        match full.rsplit_once('.') {
            Some((device, measurement)) if !device.is_empty() && !measurement.is_empty() => {
                Ok(Self::new(device, measurement))
            }
            _ => Err(TesseraError::InvalidFormat(format!(
                "Series path {} has no measurement",
                full
            ))),
        }
    }
}

impl fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_path() {
        let path = SeriesPath::parse("root.sg1.d1.s1").unwrap();
        assert_eq!(path.device, "root.sg1.d1");
        assert_eq!(path.measurement, "s1");
        assert_eq!(path.to_string(), "root.sg1.d1.s1");
        assert!(SeriesPath::parse("nodot").is_err());
        assert!(SeriesPath::parse("root.").is_err());
    }

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(300, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(200));
        assert!(!range1.contains(250));
        assert_eq!(range1.intersect(&range2), Some(TimeRange::new(150, 200)));
        assert_eq!(range1.intersect(&range3), None);
    }

    #[test]
    fn test_value_compare() {
        assert_eq!(Value::Int32(3).compare(&Value::Double(3.5)), Some(Ordering::Less));
        assert_eq!(Value::Int64(7).compare(&Value::Int64(7)), Some(Ordering::Equal));
        assert_eq!(Value::Text("a".into()).compare(&Value::Int32(1)), None);
        assert_eq!(Value::parse(DataType::Float, " 1.5").unwrap(), Value::Float(1.5));
        assert!(Value::parse(DataType::Int32, "x").is_err());
    }

    #[test]
    fn test_record_size() {
        let record = TsRecord::new("root.sg.d1", 10)
            .with_point("s1", 1i32)
            .with_point("s2", "abc");
        // device + timestamp + (2 + 4 + 8) + (2 + 3 + 8)
        assert_eq!(record.estimated_size(), (10 + 8 + 14 + 13) as u64);
    }
}
