//! Merge of overflow data into the sequence files

use super::TsFileResource;
use crate::memtable::SeriesData;
use crate::query::reader::{read_all, SeriesReader};
use crate::query::{
    GlobalSortedSeriesDataSource, OverflowSeriesDataSource, QueryContext, QueryDataSource,
};
use crate::tsfile::{TsFileConfig, TsFileReader, TsFileWriter};
use crate::{Result, SeriesPath};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rewrites a snapshot of sealed and overflow files into one sealed file.
///
/// Every series is read through the full query path, so tombstones are
/// applied and overflow points replace sequence points. Chunks of the new
/// file carry the merge version.
pub(super) struct MergeTask {
    pub storage_group: String,
    pub sealed: Vec<TsFileResource>,
    pub overflow: Vec<TsFileResource>,
    pub version: u64,
    pub target: PathBuf,
    pub config: TsFileConfig,
}

impl MergeTask {
    /// Merged file, or `None` if nothing survived; a failed merge leaves no
    /// file behind
    pub fn run(&self) -> Result<Option<TsFileResource>> {
        let result = self.write();
        match &result {
            Ok(Some(merged)) => info!(
                "Merged {} sealed and {} overflow files of {} into {:?}",
                self.sealed.len(),
                self.overflow.len(),
                self.storage_group,
                merged.path
            ),
            Ok(None) => info!("Merge of {} left no data", self.storage_group),
            Err(_) => {
                if let Err(e) = TsFileResource::new(&self.target).remove() {
                    warn!("Cannot remove partial merge file {:?}: {}", self.target, e);
                }
            }
        }
        result
    }

    /// Every device and measurement present in the snapshot
    fn series(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut series: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for file in self.sealed.iter().chain(self.overflow.iter()) {
            let reader = TsFileReader::open(&file.path)?;
            for device in reader.devices() {
                let measurements = reader.measurements(&device);
                series.entry(device).or_default().extend(measurements);
            }
        }
        Ok(series)
    }

    fn source(&self, path: &SeriesPath) -> QueryDataSource {
        let holding = |files: &[TsFileResource]| -> Vec<TsFileResource> {
            files
                .iter()
                .filter(|f| f.contains_device(&path.device))
                .cloned()
                .collect()
        };
        QueryDataSource {
            seq: GlobalSortedSeriesDataSource {
                path: path.clone(),
                sealed: holding(&self.sealed),
                unsealed: None,
                mem: None,
            },
            overflow: OverflowSeriesDataSource {
                path: path.clone(),
                files: holding(&self.overflow),
                mem: None,
            },
        }
    }

    fn write(&self) -> Result<Option<TsFileResource>> {
        let series = self.series()?;
        let ctx = Arc::new(QueryContext::new(self.version));
        let mut writer = TsFileWriter::open(&self.target, self.config.clone())?;
        let mut resource = TsFileResource::new(&self.target);

        for (device, measurements) in series {
            for measurement in measurements {
                let path = SeriesPath::new(device.as_str(), measurement.as_str());
                let mut reader = SeriesReader::new(self.source(&path), None, ctx.clone(), false)?;
                let points = read_all(&mut reader)?;
                let Some(first) = points.first() else {
                    debug!("Series {} is empty after merge", path);
                    continue;
                };
                let data_type = first.value.data_type();
                let group = writer.write_chunk_group(
                    &device,
                    self.version,
                    vec![SeriesData {
                        measurement,
                        data_type,
                        points,
                    }],
                )?;
                if let (Some(start), Some(end)) = (group.start_time(), group.end_time()) {
                    resource.update_start_time(&device, start);
                    resource.update_end_time(&device, end);
                }
            }
            writer.flush()?;
        }

        if resource.start_times.is_empty() {
            drop(writer);
            resource.remove()?;
            return Ok(None);
        }
        writer.end_file()?;
        Ok(Some(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modification::Deletion;
    use crate::{DataType, TimeValuePair, Value};
    use std::path::Path;
    use tempfile::TempDir;

    fn write_file(path: &Path, version: u64, points: &[(i64, i64)]) -> TsFileResource {
        let mut writer = TsFileWriter::open(path, TsFileConfig::default()).unwrap();
        let series = SeriesData {
            measurement: "s1".into(),
            data_type: DataType::Int64,
            points: points.iter().map(|&(t, v)| TimeValuePair::new(t, v)).collect(),
        };
        writer.write_chunk_group("root.sg.d1", version, vec![series]).unwrap();
        writer.end_file().unwrap();
        TsFileResource::from_sealed_file(path).unwrap()
    }

    #[test]
    fn test_merge_applies_overflow_and_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let sealed = vec![
            write_file(&dir.join("1-1.tsfile"), 1, &[(1, 1), (2, 1), (3, 1)]),
            write_file(&dir.join("2-2.tsfile"), 2, &[(10, 1), (11, 1)]),
        ];
        let overflow = vec![write_file(&dir.join("3-3.tsfile"), 3, &[(2, 7), (5, 7)])];
        sealed[0]
            .modification_file()
            .write(&Deletion::new(SeriesPath::new("root.sg.d1", "s1"), 4, 1))
            .unwrap();

        let task = MergeTask {
            storage_group: "root.sg".into(),
            sealed,
            overflow,
            version: 5,
            target: dir.join("4-5.tsfile"),
            config: TsFileConfig::default(),
        };
        let merged = task.run().unwrap().unwrap();
        assert_eq!(merged.start_time("root.sg.d1"), Some(2));
        assert_eq!(merged.end_time("root.sg.d1"), Some(11));

        let reader = TsFileReader::open(&merged.path).unwrap();
        let chunks = reader.chunk_metadata("root.sg.d1", "s1");
        assert!(chunks.iter().all(|c| c.version == 5));
        let points: Vec<_> = chunks
            .iter()
            .flat_map(|c| reader.read_chunk(c).unwrap().points)
            .map(|p| (p.timestamp, p.value))
            .collect();
        assert_eq!(
            points,
            vec![
                (2, Value::Int64(7)),
                (3, Value::Int64(1)),
                (5, Value::Int64(7)),
                (10, Value::Int64(1)),
                (11, Value::Int64(1)),
            ]
        );
    }

    #[test]
    fn test_failed_merge_leaves_no_file() {
        let temp_dir = TempDir::new().unwrap();
        let task = MergeTask {
            storage_group: "root.sg".into(),
            sealed: vec![TsFileResource::new(temp_dir.path().join("missing.tsfile"))],
            overflow: Vec::new(),
            version: 2,
            target: temp_dir.path().join("1-2.tsfile"),
            config: TsFileConfig::default(),
        };
        assert!(task.run().is_err());
        assert!(!task.target.exists());
    }
}
