//! MemTable implementation
//!
//! A MemTable maps device -> measurement -> time-ordered values. Writes and
//! deletes take `&self`: the device map is behind a read/write lock that is
//! only taken for writing when a new series appears, and each series is a
//! concurrent skip map.

mod chunk;
mod series;

pub use chunk::{MemChunkIter, ReadOnlyMemChunk};
pub use series::MemSeries;

use crate::{DataType, Result, TesseraError, TimeValuePair, Timestamp, TsRecord, Value};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

type DeviceMap = BTreeMap<String, BTreeMap<String, MemSeries>>;

/// Points of one series, sorted by time, ready for serialization
#[derive(Debug, Clone)]
pub struct SeriesData {
    pub measurement: String,
    pub data_type: DataType,
    pub points: Vec<TimeValuePair>,
}

/// In-memory store of unflushed points
#[derive(Default)]
pub struct MemTable {
    devices: RwLock<DeviceMap>,
    value_count: AtomicUsize,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every point of a record; nothing is written if any value has
    /// the wrong type
    pub fn write(&self, record: &TsRecord) -> Result<()> {
        for point in &record.points {
            if let Some(data_type) = self.data_type(&record.device, &point.measurement) {
                if data_type != point.value.data_type() {
                    return Err(TesseraError::InvalidValue(format!(
                        "{}.{} is {}, got {}",
                        record.device,
                        point.measurement,
                        data_type,
                        point.value.data_type()
                    )));
                }
            }
        }
        for point in &record.points {
            self.write_point(
                &record.device,
                &point.measurement,
                record.timestamp,
                point.value.clone(),
            )?;
        }
        Ok(())
    }

    /// Insert one point. The first value of a series fixes its data type.
    pub fn write_point(
        &self,
        device: &str,
        measurement: &str,
        timestamp: Timestamp,
        value: Value,
    ) -> Result<()> {
        self.insert_point(device, measurement, timestamp, value, true)
    }

    /// Put back the points of an older table that this one does not hold.
    /// Used when a frozen table could not be flushed.
    pub fn absorb(&self, older: &MemTable) -> usize {
        let before = self.value_count();
        for (device, series) in older.snapshot() {
            for s in series {
                for p in s.points {
                    // a type clash means the series was redefined; the newer data wins
                    if let Err(e) =
                        self.insert_point(&device, &s.measurement, p.timestamp, p.value, false)
                    {
                        warn!("Dropping {}.{} at {}: {}", device, s.measurement, p.timestamp, e);
                    }
                }
            }
        }
        self.value_count().saturating_sub(before)
    }

    fn insert_point(
        &self,
        device: &str,
        measurement: &str,
        timestamp: Timestamp,
        value: Value,
        overwrite: bool,
    ) -> Result<()> {
        {
            let devices = self.devices.read();
            if let Some(series) = devices.get(device).and_then(|m| m.get(measurement)) {
                return self.write_series(series, device, measurement, timestamp, value, overwrite);
            }
        }

        let mut devices = self.devices.write();
        let series = devices
            .entry(device.to_string())
            .or_default()
            .entry(measurement.to_string())
            .or_insert_with(|| MemSeries::new(value.data_type()));
        self.write_series(series, device, measurement, timestamp, value, overwrite)
    }

    fn write_series(
        &self,
        series: &MemSeries,
        device: &str,
        measurement: &str,
        timestamp: Timestamp,
        value: Value,
        overwrite: bool,
    ) -> Result<()> {
        if series.data_type() != value.data_type() {
            return Err(TesseraError::InvalidValue(format!(
                "{}.{} is {}, got {}",
                device,
                measurement,
                series.data_type(),
                value.data_type()
            )));
        }
        let fresh = if overwrite {
            series.write(timestamp, value)
        } else {
            series.write_if_absent(timestamp, value)
        };
        if fresh {
            self.value_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Delete every point of a series at or before `timestamp`
    pub fn delete(&self, device: &str, measurement: &str, timestamp: Timestamp) -> usize {
        let devices = self.devices.read();
        let removed = devices
            .get(device)
            .and_then(|m| m.get(measurement))
            .map_or(0, |series| series.delete_upto(timestamp));
        self.value_count.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// Sorted copy of one series
    pub fn query(&self, device: &str, measurement: &str) -> Option<SeriesData> {
        let devices = self.devices.read();
        let series = devices.get(device)?.get(measurement)?;
        Some(SeriesData {
            measurement: measurement.to_string(),
            data_type: series.data_type(),
            points: series.sorted_points(),
        })
    }

    /// Data type of a series, if it has been written
    pub fn data_type(&self, device: &str, measurement: &str) -> Option<DataType> {
        let devices = self.devices.read();
        devices.get(device)?.get(measurement).map(MemSeries::data_type)
    }

    /// Sorted copy of every non-empty series, grouped by device
    pub fn snapshot(&self) -> Vec<(String, Vec<SeriesData>)> {
        let devices = self.devices.read();
        devices
            .iter()
            .filter_map(|(device, measurements)| {
                let series: Vec<SeriesData> = measurements
                    .iter()
                    .filter(|(_, s)| !s.is_empty())
                    .map(|(measurement, s)| SeriesData {
                        measurement: measurement.clone(),
                        data_type: s.data_type(),
                        points: s.sorted_points(),
                    })
                    .collect();
                (!series.is_empty()).then(|| (device.clone(), series))
            })
            .collect()
    }

    /// Devices with at least one point
    pub fn devices(&self) -> Vec<String> {
        let devices = self.devices.read();
        devices
            .iter()
            .filter(|(_, m)| m.values().any(|s| !s.is_empty()))
            .map(|(d, _)| d.clone())
            .collect()
    }

    /// Earliest and latest timestamp of a device
    pub fn device_time_range(&self, device: &str) -> Option<(Timestamp, Timestamp)> {
        let devices = self.devices.read();
        let measurements = devices.get(device)?;
        let min = measurements.values().filter_map(MemSeries::min_time).min()?;
        let max = measurements.values().filter_map(MemSeries::max_time).max()?;
        Some((min, max))
    }

    /// Number of distinct (series, timestamp) points
    pub fn value_count(&self) -> usize {
        self.value_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.value_count() == 0
    }

    /// Deep copy, used for copy-on-write while a flush reads the original
    pub fn copy(&self) -> MemTable {
        let devices = self.devices.read();
        let copy: DeviceMap = devices
            .iter()
            .map(|(device, measurements)| {
                let measurements = measurements
                    .iter()
                    .map(|(m, s)| (m.clone(), s.copy()))
                    .collect();
                (device.clone(), measurements)
            })
            .collect();
        MemTable {
            devices: RwLock::new(copy),
            value_count: AtomicUsize::new(self.value_count()),
        }
    }

    /// Drop all data so the table can be reused
    pub fn clear(&mut self) {
        self.devices.get_mut().clear();
        *self.value_count.get_mut() = 0;
    }
}
