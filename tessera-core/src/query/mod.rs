//! Read path
//!
//! A query on one series receives a [`QueryDataSource`] describing every
//! place its points may live: sealed sequence files, the open file, the
//! buffer-write memtables, overflow files and the overflow memtable. The
//! readers in [`reader`] merge them into one time-ordered stream.

pub mod filter;
pub mod reader;

pub use filter::{CompareOp, Filter};
pub use reader::{BatchReader, SequenceDataReader, SeriesReader};

use crate::memtable::ReadOnlyMemChunk;
use crate::modification::{Deletion, ModificationFile};
use crate::storage::TsFileResource;
use crate::tsfile::ChunkMetadata;
use crate::{Result, SeriesPath};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-query state passed explicitly through the read path
pub struct QueryContext {
    job_id: u64,
    modifications: Mutex<HashMap<PathBuf, Arc<Vec<Deletion>>>>,
}

impl QueryContext {
    pub fn new(job_id: u64) -> Self {
        Self {
            job_id,
            modifications: Mutex::new(HashMap::new()),
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Deletions recorded against a data file, read once per query
    pub fn modifications(&self, data_file: &Path) -> Result<Arc<Vec<Deletion>>> {
        if let Some(cached) = self.modifications.lock().get(data_file) {
            return Ok(cached.clone());
        }
        let deletions = Arc::new(ModificationFile::for_data_file(data_file).read()?);
        self.modifications
            .lock()
            .insert(data_file.to_path_buf(), deletions.clone());
        Ok(deletions)
    }

    /// Deletions of one series in a data file
    pub fn series_modifications(&self, data_file: &Path, path: &SeriesPath) -> Result<Vec<Deletion>> {
        Ok(self
            .modifications(data_file)?
            .iter()
            .filter(|d| &d.path == path)
            .cloned()
            .collect())
    }
}

/// Chunks of a series already durable in the open file
#[derive(Debug, Clone)]
pub struct UnsealedTsFile {
    pub path: PathBuf,
    pub chunks: Vec<ChunkMetadata>,
}

/// In-order data of one series
#[derive(Debug, Clone)]
pub struct GlobalSortedSeriesDataSource {
    pub path: SeriesPath,
    /// Sealed files holding the device, oldest first
    pub sealed: Vec<TsFileResource>,
    pub unsealed: Option<UnsealedTsFile>,
    /// Flushing and work memtable view
    pub mem: Option<ReadOnlyMemChunk>,
}

/// Out-of-order data of one series
#[derive(Debug, Clone)]
pub struct OverflowSeriesDataSource {
    pub path: SeriesPath,
    /// Sealed overflow files holding the device, oldest first
    pub files: Vec<TsFileResource>,
    pub mem: Option<ReadOnlyMemChunk>,
}

/// Everything a query needs to read one series
#[derive(Debug, Clone)]
pub struct QueryDataSource {
    pub seq: GlobalSortedSeriesDataSource,
    pub overflow: OverflowSeriesDataSource,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_modifications_are_cached_per_query() {
        let temp_dir = TempDir::new().unwrap();
        let data_file = temp_dir.path().join("1-1.tsfile");
        let mods = ModificationFile::for_data_file(&data_file);
        let path = SeriesPath::new("root.sg.d1", "s1");
        mods.write(&Deletion::new(path.clone(), 2, 10)).unwrap();
        mods.write(&Deletion::new(SeriesPath::new("root.sg.d1", "s2"), 2, 10))
            .unwrap();

        let ctx = QueryContext::new(7);
        assert_eq!(ctx.job_id(), 7);
        assert_eq!(ctx.series_modifications(&data_file, &path).unwrap().len(), 1);

        // a later deletion is not visible to the running query
        mods.write(&Deletion::new(path.clone(), 3, 20)).unwrap();
        assert_eq!(ctx.modifications(&data_file).unwrap().len(), 2);
        assert_eq!(QueryContext::new(8).modifications(&data_file).unwrap().len(), 3);
    }
}
