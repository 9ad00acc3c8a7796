//! Columnar file layer
//!
//! A TsFile is a header followed by chunk groups (one per device per flush,
//! one chunk per measurement) and, once sealed, an index of every chunk group
//! plus a footer:
//!
//! ```text
//! | MAGIC | version u32 | chunk ... | index | index_offset u64 | index_len u32 | crc u32 | MAGIC |
//! ```
//!
//! While a file is open, the writer keeps a `<file>.restore` companion
//! holding the last durable length and the chunk groups written so far.
//! Reopening an unsealed file truncates it back to that point.

mod chunk;
mod reader;
mod writer;

pub use chunk::Chunk;
pub use reader::{ChunkLoader, TsFileReader};
pub use writer::TsFileWriter;

use crate::{DataType, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File magic, at the start and the end of a sealed file
pub const MAGIC: &[u8; 6] = b"TsFile";

/// File format version
pub const FORMAT_VERSION: u32 = 1;

/// Header length: magic + version
pub const HEADER_SIZE: u64 = MAGIC.len() as u64 + 4;

/// Footer length: index offset + index length + crc + magic
pub const FOOTER_SIZE: u64 = 8 + 4 + 4 + MAGIC.len() as u64;

/// Extension of sequence and overflow data files
pub const TSFILE_SUFFIX: &str = "tsfile";

/// Location and statistics of one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub measurement: String,
    pub data_type: DataType,
    /// Byte offset of the chunk in its file
    pub offset: u64,
    /// Chunk length in bytes
    pub size: u32,
    /// Number of points
    pub count: u32,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// Version of the flush or merge that wrote the chunk
    pub version: u64,
    /// Points at or before this time are deleted; set at read time
    #[serde(skip, default = "not_deleted")]
    pub deleted_at: Timestamp,
}

fn not_deleted() -> Timestamp {
    Timestamp::MIN
}

impl ChunkMetadata {
    /// True when every point of the chunk is masked by a deletion
    pub fn fully_deleted(&self) -> bool {
        self.end_time <= self.deleted_at
    }
}

/// Chunks written for one device by one flush
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkGroupMetadata {
    pub device: String,
    pub version: u64,
    pub chunks: Vec<ChunkMetadata>,
}

impl ChunkGroupMetadata {
    pub fn start_time(&self) -> Option<Timestamp> {
        self.chunks.iter().map(|c| c.start_time).min()
    }

    pub fn end_time(&self) -> Option<Timestamp> {
        self.chunks.iter().map(|c| c.end_time).max()
    }
}

/// Chunks of one series across chunk groups, in write order
pub fn series_chunks(
    groups: &[ChunkGroupMetadata],
    device: &str,
    measurement: &str,
) -> Vec<ChunkMetadata> {
    groups
        .iter()
        .filter(|g| g.device == device)
        .flat_map(|g| g.chunks.iter())
        .filter(|c| c.measurement == measurement)
        .cloned()
        .collect()
}

/// Path of the restore companion of a file
pub fn restore_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".restore");
    PathBuf::from(name)
}

/// Writer options
#[derive(Debug, Clone)]
pub struct TsFileConfig {
    /// LZ4-compress chunk payloads
    pub compression: bool,
}

impl Default for TsFileConfig {
    fn default() -> Self {
        Self { compression: true }
    }
}
