//! Tombstones recorded against files that are never rewritten
//!
//! Each data file may have a `<file>.mods` companion listing deletions. A
//! deletion masks every point of its series at or before `timestamp` in
//! chunks written with a version below the deletion's version.

use crate::tsfile::ChunkMetadata;
use crate::{Result, SeriesPath, TesseraError, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Delete of `path` up to and including `timestamp`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deletion {
    pub path: SeriesPath,
    pub version: u64,
    pub timestamp: Timestamp,
}

impl Deletion {
    pub fn new(path: SeriesPath, version: u64, timestamp: Timestamp) -> Self {
        Self {
            path,
            version,
            timestamp,
        }
    }
}

/// Append-only list of deletions of one data file
pub struct ModificationFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ModificationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Companion of a data file
    pub fn for_data_file(data_file: &Path) -> Self {
        let mut name = data_file.as_os_str().to_os_string();
        name.push(".mods");
        Self::new(PathBuf::from(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one deletion and sync
    pub fn write(&self, deletion: &Deletion) -> Result<()> {
        let payload = bincode::serialize(deletion)?;
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32fast::hash(&payload));

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Every deletion on disk, in write order; a torn tail is ignored
    pub fn read(&self) -> Result<Vec<Deletion>> {
        let _guard = self.lock.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;

        let mut deletions = Vec::new();
        let mut cursor = &data[..];
        while cursor.remaining() >= 4 {
            let len = (&cursor[..4]).get_u32_le() as usize;
            if cursor.remaining() < 4 + len + 4 {
                warn!("Torn deletion record in {:?}", self.path);
                break;
            }
            cursor.advance(4);
            let payload = &cursor[..len];
            let expected = (&cursor[len..len + 4]).get_u32_le();
            let actual = crc32fast::hash(payload);
            if expected != actual {
                warn!(
                    "{}",
                    TesseraError::ChecksumMismatch { expected, actual }
                );
                break;
            }
            deletions.push(bincode::deserialize(payload)?);
            cursor.advance(len + 4);
        }
        Ok(deletions)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn remove(&self) -> Result<()> {
        let _guard = self.lock.lock();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Mask series chunks with the deletions that cover them and drop chunks
/// with nothing left
pub fn apply_deletions(chunks: &mut Vec<ChunkMetadata>, deletions: &[Deletion]) {
    for chunk in chunks.iter_mut() {
        for deletion in deletions {
            if chunk.version < deletion.version && deletion.timestamp > chunk.deleted_at {
                chunk.deleted_at = deletion.timestamp;
            }
        }
    }
    chunks.retain(|c| !c.fully_deleted());
}

/// Deletions of one series
pub fn deletions_for<'a>(
    deletions: &'a [Deletion],
    path: &'a SeriesPath,
) -> impl Iterator<Item = &'a Deletion> + 'a {
    deletions.iter().filter(move |d| &d.path == path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataType;
    use tempfile::TempDir;

    fn chunk(version: u64, start: i64, end: i64) -> ChunkMetadata {
        ChunkMetadata {
            measurement: "s1".into(),
            data_type: DataType::Int64,
            offset: 10,
            size: 100,
            count: 10,
            start_time: start,
            end_time: end,
            version,
            deleted_at: Timestamp::MIN,
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let mods = ModificationFile::for_data_file(&temp_dir.path().join("1-1.tsfile"));
        assert!(mods.read().unwrap().is_empty());

        let path = SeriesPath::new("root.sg.d1", "s1");
        mods.write(&Deletion::new(path.clone(), 3, 100)).unwrap();
        mods.write(&Deletion::new(path.clone(), 5, 200)).unwrap();

        let read = mods.read().unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1], Deletion::new(path, 5, 200));
        assert!(mods.path().to_string_lossy().ends_with("1-1.tsfile.mods"));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let mods = ModificationFile::new(temp_dir.path().join("a.mods"));
        mods.write(&Deletion::new(SeriesPath::new("root.sg.d1", "s1"), 1, 5))
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(mods.path()).unwrap();
        file.write_all(&[200, 0, 0, 0, 9]).unwrap();

        assert_eq!(mods.read().unwrap().len(), 1);
        mods.remove().unwrap();
        assert!(!mods.exists());
    }

    #[test]
    fn test_apply_deletions_respects_versions() {
        let path = SeriesPath::new("root.sg.d1", "s1");
        let mut chunks = vec![chunk(1, 0, 50), chunk(2, 60, 120), chunk(9, 130, 140)];
        let deletions = vec![Deletion::new(path.clone(), 5, 100)];

        apply_deletions(&mut chunks, &deletions);

        // fully masked chunk dropped, newer chunk untouched
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].version, 2);
        assert_eq!(chunks[0].deleted_at, 100);
        assert_eq!(chunks[1].deleted_at, Timestamp::MIN);
    }
}
