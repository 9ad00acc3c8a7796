//! Append-only writer of one TsFile

use super::{
    restore_path, Chunk, ChunkGroupMetadata, ChunkMetadata, TsFileConfig, FORMAT_VERSION,
    HEADER_SIZE, MAGIC,
};
use crate::memtable::SeriesData;
use crate::{Result, TesseraError, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Durable state of an unsealed file
#[derive(Debug, Serialize, Deserialize)]
struct RestoreState {
    valid_length: u64,
    chunk_groups: Vec<ChunkGroupMetadata>,
}

/// Writer of an open (unsealed) TsFile
///
/// Chunk groups are staged in memory by [`write_chunk_group`] and become
/// durable on [`flush`]. [`rollback`] discards everything staged since the
/// last flush and truncates the file back to its durable length.
///
/// [`write_chunk_group`]: TsFileWriter::write_chunk_group
/// [`flush`]: TsFileWriter::flush
/// [`rollback`]: TsFileWriter::rollback
pub struct TsFileWriter {
    path: PathBuf,
    file: File,
    config: TsFileConfig,
    buffer: BytesMut,
    durable_len: u64,
    flushed: Vec<ChunkGroupMetadata>,
    pending: Vec<ChunkGroupMetadata>,
    sealed: bool,
}

impl TsFileWriter {
    /// Create a new file, or reopen an unsealed one at its last durable point
    pub fn open(path: impl AsRef<Path>, config: TsFileConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (file, durable_len, flushed) = if path.exists() {
            Self::recover(&path)?
        } else {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?;
            let mut header = BytesMut::with_capacity(HEADER_SIZE as usize);
            header.put_slice(MAGIC);
            header.put_u32_le(FORMAT_VERSION);
            file.write_all(&header)?;
            file.sync_all()?;
            (file, HEADER_SIZE, Vec::new())
        };

        let writer = Self {
            path,
            file,
            config,
            buffer: BytesMut::new(),
            durable_len,
            flushed,
            pending: Vec::new(),
            sealed: false,
        };
        writer.write_restore(writer.durable_len)?;
        Ok(writer)
    }

    fn recover(path: &Path) -> Result<(File, u64, Vec<ChunkGroupMetadata>)> {
        if super::TsFileReader::is_sealed(path)? {
            return Err(TesseraError::InvalidState(format!(
                "{:?} is sealed and cannot be reopened for writing",
                path
            )));
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|_| TesseraError::Corruption(format!("{:?} has no header", path)))?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(TesseraError::InvalidFormat(format!(
                "{:?} is not a TsFile",
                path
            )));
        }

        let state = match Self::read_restore(path) {
            Ok(state) => state,
            Err(e) => {
                warn!("No usable restore state for {:?} ({}), truncating to header", path, e);
                RestoreState {
                    valid_length: HEADER_SIZE,
                    chunk_groups: Vec::new(),
                }
            }
        };

        let file_len = file.metadata()?.len();
        if file_len < state.valid_length {
            return Err(TesseraError::Corruption(format!(
                "{:?} is {} bytes, restore state expects {}",
                path, file_len, state.valid_length
            )));
        }
        if file_len > state.valid_length {
            warn!(
                "Truncating {:?} from {} to {} bytes",
                path, file_len, state.valid_length
            );
            file.set_len(state.valid_length)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(state.valid_length))?;
        info!(
            "Reopened {:?} with {} chunk groups",
            path,
            state.chunk_groups.len()
        );
        Ok((file, state.valid_length, state.chunk_groups))
    }

    fn read_restore(path: &Path) -> Result<RestoreState> {
        let data = fs::read(restore_path(path))?;
        if data.len() < 4 {
            return Err(TesseraError::Corruption("restore state too short".into()));
        }
        let (body, mut tail) = data.split_at(data.len() - 4);
        let expected = tail.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TesseraError::ChecksumMismatch { expected, actual });
        }
        Ok(bincode::deserialize(body)?)
    }

    fn write_restore(&self, valid_length: u64) -> Result<()> {
        let state = RestoreState {
            valid_length,
            chunk_groups: self.flushed.clone(),
        };
        let mut data = bincode::serialize(&state)?;
        let checksum = crc32fast::hash(&data);
        data.put_u32_le(checksum);

        let target = restore_path(&self.path);
        let mut tmp = target.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage one chunk per series for a device
    pub fn write_chunk_group(
        &mut self,
        device: &str,
        version: u64,
        series: Vec<SeriesData>,
    ) -> Result<ChunkGroupMetadata> {
        if self.sealed {
            return Err(TesseraError::InvalidState(format!(
                "{:?} is sealed",
                self.path
            )));
        }

        let mut chunks = Vec::with_capacity(series.len());
        for s in series {
            if s.points.is_empty() {
                continue;
            }
            let chunk = Chunk::new(s.measurement, s.data_type, s.points);
            let bytes = chunk.to_bytes(self.config.compression)?;
            chunks.push(ChunkMetadata {
                offset: self.position(),
                size: bytes.len() as u32,
                count: chunk.points.len() as u32,
                start_time: chunk.start_time(),
                end_time: chunk.end_time(),
                data_type: chunk.data_type,
                measurement: chunk.measurement,
                version,
                deleted_at: Timestamp::MIN,
            });
            self.buffer.put_slice(&bytes);
        }

        let group = ChunkGroupMetadata {
            device: device.to_string(),
            version,
            chunks,
        };
        self.pending.push(group.clone());
        Ok(group)
    }

    /// Make every staged chunk group durable
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() && self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.durable_len))?;
        self.file.write_all(&self.buffer)?;
        self.file.sync_data()?;

        // nothing is committed until the restore state records it
        let committed = self.flushed.len();
        let durable_len = self.durable_len + self.buffer.len() as u64;
        self.flushed.extend(self.pending.iter().cloned());
        if let Err(e) = self.write_restore(durable_len) {
            self.flushed.truncate(committed);
            return Err(e);
        }
        self.durable_len = durable_len;
        self.buffer.clear();
        self.pending.clear();
        debug!("Flushed {:?} to {} bytes", self.path, self.durable_len);
        Ok(())
    }

    /// Drop staged chunk groups and cut the file back to its durable length
    pub fn rollback(&mut self) -> Result<()> {
        self.buffer.clear();
        self.pending.clear();
        self.file.set_len(self.durable_len)?;
        self.file.seek(SeekFrom::Start(self.durable_len))?;
        Ok(())
    }

    /// Current logical length, staged bytes included
    pub fn position(&self) -> u64 {
        self.durable_len + self.buffer.len() as u64
    }

    /// Durable chunk groups, in write order
    pub fn chunk_groups(&self) -> &[ChunkGroupMetadata] {
        &self.flushed
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Flush, append the index and footer, and drop the restore state
    pub fn end_file(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.flush()?;

        let index = bincode::serialize(&self.flushed)?;
        let mut tail = BytesMut::with_capacity(index.len() + super::FOOTER_SIZE as usize);
        tail.put_slice(&index);
        tail.put_u64_le(self.durable_len);
        tail.put_u32_le(index.len() as u32);
        tail.put_u32_le(crc32fast::hash(&index));
        tail.put_slice(MAGIC);

        self.file.seek(SeekFrom::Start(self.durable_len))?;
        self.file.write_all(&tail)?;
        self.file.sync_all()?;
        self.durable_len += tail.len() as u64;
        self.sealed = true;

        let restore = restore_path(&self.path);
        if restore.exists() {
            fs::remove_file(restore)?;
        }
        info!(
            "Sealed {:?}: {} chunk groups, {} bytes",
            self.path,
            self.flushed.len(),
            self.durable_len
        );
        Ok(())
    }
}
