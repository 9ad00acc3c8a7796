//! TsFile reader for querying data

use super::{
    Chunk, ChunkGroupMetadata, ChunkMetadata, FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC,
};
use crate::{Result, TesseraError, Timestamp};
use bytes::Buf;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Random-access chunk reads from a file, sealed or not
pub struct ChunkLoader {
    path: PathBuf,
    file: Mutex<File>,
}

impl ChunkLoader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode the chunk a metadata entry points at
    pub fn load(&self, meta: &ChunkMetadata) -> Result<Chunk> {
        let mut data = vec![0u8; meta.size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(meta.offset))?;
            file.read_exact(&mut data)?;
        }
        let chunk = Chunk::from_bytes(&data)?;
        if chunk.measurement != meta.measurement {
            return Err(TesseraError::Corruption(format!(
                "{:?} offset {}: expected chunk {}, found {}",
                self.path, meta.offset, meta.measurement, chunk.measurement
            )));
        }
        Ok(chunk)
    }
}

type SeriesIndex = BTreeMap<String, BTreeMap<String, Vec<ChunkMetadata>>>;

/// Reader of a sealed TsFile
pub struct TsFileReader {
    loader: ChunkLoader,
    groups: Vec<ChunkGroupMetadata>,
    index: SeriesIndex,
}

impl TsFileReader {
    /// Open a sealed file, validating header, footer and index checksum
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(TesseraError::InvalidFormat(format!(
                "{:?} is too short to be sealed",
                path
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let mut cursor = std::io::Cursor::new(&header[..]);
        let mut magic = [0u8; MAGIC.len()];
        cursor.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(TesseraError::InvalidFormat("Invalid TsFile header".into()));
        }
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TesseraError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let mut cursor = std::io::Cursor::new(&footer[..]);
        let index_offset = cursor.get_u64_le();
        let index_len = cursor.get_u32_le() as u64;
        let expected_checksum = cursor.get_u32_le();
        cursor.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(TesseraError::InvalidFormat(format!(
                "{:?} has no footer",
                path
            )));
        }
        if index_offset < HEADER_SIZE || index_offset + index_len + FOOTER_SIZE != file_size {
            return Err(TesseraError::Corruption(format!(
                "{:?}: index at {} of {} bytes does not fit file of {} bytes",
                path, index_offset, index_len, file_size
            )));
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_data = vec![0u8; index_len as usize];
        file.read_exact(&mut index_data)?;
        let actual_checksum = crc32fast::hash(&index_data);
        if expected_checksum != actual_checksum {
            return Err(TesseraError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }
        let groups: Vec<ChunkGroupMetadata> = bincode::deserialize(&index_data)?;

        let mut index = SeriesIndex::new();
        for group in &groups {
            let measurements = index.entry(group.device.clone()).or_default();
            for chunk in &group.chunks {
                measurements
                    .entry(chunk.measurement.clone())
                    .or_default()
                    .push(chunk.clone());
            }
        }

        Ok(Self {
            loader: ChunkLoader {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            },
            groups,
            index,
        })
    }

    /// True when the file ends with a footer
    pub fn is_sealed(path: impl AsRef<Path>) -> Result<bool> {
        let mut file = File::open(path)?;
        if file.metadata()?.len() < HEADER_SIZE + FOOTER_SIZE {
            return Ok(false);
        }
        file.seek(SeekFrom::End(-(MAGIC.len() as i64)))?;
        let mut magic = [0u8; MAGIC.len()];
        file.read_exact(&mut magic)?;
        Ok(&magic == MAGIC)
    }

    pub fn path(&self) -> &Path {
        self.loader.path()
    }

    /// Chunks of one series in write order
    pub fn chunk_metadata(&self, device: &str, measurement: &str) -> Vec<ChunkMetadata> {
        self.index
            .get(device)
            .and_then(|m| m.get(measurement))
            .cloned()
            .unwrap_or_default()
    }

    pub fn chunk_groups(&self) -> &[ChunkGroupMetadata] {
        &self.groups
    }

    pub fn devices(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    pub fn measurements(&self, device: &str) -> Vec<String> {
        self.index
            .get(device)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Earliest start and latest end over the chunks of a device
    pub fn device_time_range(&self, device: &str) -> Option<(Timestamp, Timestamp)> {
        let chunks = self.index.get(device)?.values().flatten();
        chunks.fold(None, |range, c| match range {
            None => Some((c.start_time, c.end_time)),
            Some((start, end)) => Some((start.min(c.start_time), end.max(c.end_time))),
        })
    }

    pub fn read_chunk(&self, meta: &ChunkMetadata) -> Result<Chunk> {
        self.loader.load(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::SeriesData;
    use crate::tsfile::{TsFileConfig, TsFileWriter};
    use crate::{DataType, TimeValuePair, Value};
    use tempfile::TempDir;

    fn series(measurement: &str, times: &[i64]) -> SeriesData {
        SeriesData {
            measurement: measurement.to_string(),
            data_type: DataType::Double,
            points: times
                .iter()
                .map(|&t| TimeValuePair::new(t, Value::Double(t as f64 / 2.0)))
                .collect(),
        }
    }

    #[test]
    fn test_index_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.tsfile");
        let mut writer = TsFileWriter::open(&path, TsFileConfig::default()).unwrap();
        writer
            .write_chunk_group("root.sg.d1", 1, vec![series("s1", &[1, 2, 3])])
            .unwrap();
        writer
            .write_chunk_group("root.sg.d2", 1, vec![series("s1", &[10, 20])])
            .unwrap();
        writer.flush().unwrap();
        writer
            .write_chunk_group("root.sg.d1", 2, vec![series("s1", &[4, 5]), series("s2", &[7])])
            .unwrap();
        writer.end_file().unwrap();

        assert!(TsFileReader::is_sealed(&path).unwrap());
        let reader = TsFileReader::open(&path).unwrap();
        assert_eq!(reader.devices(), vec!["root.sg.d1", "root.sg.d2"]);
        assert_eq!(reader.measurements("root.sg.d1"), vec!["s1", "s2"]);
        assert_eq!(reader.device_time_range("root.sg.d1"), Some((1, 7)));

        let chunks = reader.chunk_metadata("root.sg.d1", "s1");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].version, 1);
        assert_eq!(chunks[1].version, 2);
        let second = reader.read_chunk(&chunks[1]).unwrap();
        assert_eq!(second.points[0], TimeValuePair::new(4, 2.0));
        assert!(reader.chunk_metadata("root.sg.d3", "s1").is_empty());
    }

    #[test]
    fn test_unsealed_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.tsfile");
        let mut writer = TsFileWriter::open(&path, TsFileConfig::default()).unwrap();
        writer
            .write_chunk_group("root.sg.d1", 1, vec![series("s1", &[1])])
            .unwrap();
        writer.flush().unwrap();

        assert!(!TsFileReader::is_sealed(&path).unwrap());
        assert!(TsFileReader::open(&path).is_err());

        // the open file is still readable chunk by chunk
        let loader = ChunkLoader::open(&path).unwrap();
        let meta = &writer.chunk_groups()[0].chunks[0];
        assert_eq!(loader.load(meta).unwrap().points.len(), 1);
    }
}
