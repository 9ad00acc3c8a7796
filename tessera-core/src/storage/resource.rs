//! Descriptor of one data file

use crate::modification::ModificationFile;
use crate::tsfile::TsFileReader;
use crate::{Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A data file with the time span of every device it holds
///
/// The end times of the open file stay empty until it is sealed; readers use
/// the in-memory high-water-marks instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsFileResource {
    pub path: PathBuf,
    pub start_times: BTreeMap<String, Timestamp>,
    pub end_times: BTreeMap<String, Timestamp>,
}

impl TsFileResource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            start_times: BTreeMap::new(),
            end_times: BTreeMap::new(),
        }
    }

    /// Rebuild from the index of a sealed file
    pub fn from_sealed_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = TsFileReader::open(path.as_ref())?;
        let mut resource = Self::new(path.as_ref());
        for device in reader.devices() {
            if let Some((start, end)) = reader.device_time_range(&device) {
                resource.start_times.insert(device.clone(), start);
                resource.end_times.insert(device, end);
            }
        }
        Ok(resource)
    }

    /// Keep the earliest start time
    pub fn update_start_time(&mut self, device: &str, time: Timestamp) {
        let entry = self
            .start_times
            .entry(device.to_string())
            .or_insert(time);
        *entry = (*entry).min(time);
    }

    /// Keep the latest end time
    pub fn update_end_time(&mut self, device: &str, time: Timestamp) {
        let entry = self.end_times.entry(device.to_string()).or_insert(time);
        *entry = (*entry).max(time);
    }

    pub fn start_time(&self, device: &str) -> Option<Timestamp> {
        self.start_times.get(device).copied()
    }

    pub fn end_time(&self, device: &str) -> Option<Timestamp> {
        self.end_times.get(device).copied()
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.start_times.contains_key(device)
    }

    /// True if the file may hold points of `device` inside `[start, end]`
    pub fn overlaps(&self, device: &str, start: Timestamp, end: Timestamp) -> bool {
        match (self.start_time(device), self.end_time(device)) {
            (Some(s), Some(e)) => s <= end && e >= start,
            (Some(s), None) => s <= end,
            _ => false,
        }
    }

    pub fn modification_file(&self) -> ModificationFile {
        ModificationFile::for_data_file(&self.path)
    }

    /// Delete the data file and its tombstones
    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        self.modification_file().remove()?;
        let restore = crate::tsfile::restore_path(&self.path);
        if restore.exists() {
            fs::remove_file(restore)?;
        }
        Ok(())
    }

    pub fn file_size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}
