//! Write-ahead log
//!
//! Every storage group owns two log nodes, one for the buffer-write path and
//! one for the overflow path. A node is a directory of numbered segment
//! files. Records are appended before the memtable is touched; a node drops
//! the segments covered by a flush once that flush is durable, and replays
//! the rest after a restart.

mod entry;
mod node;
mod reader;
mod writer;

pub use entry::{Decoded, EntryKind, WalEntry};
pub use node::WriteLogNode;
pub use reader::WalReader;
pub use writer::WalWriter;

use crate::{Result, SeriesPath, TimeRange, Timestamp, TsRecord, Value};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

const SEGMENT_SUFFIX: &str = "wal";

/// When appended records are forced to disk
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// After every record
    #[default]
    Immediate,
    /// Once this many records are pending
    EveryN(usize),
    /// Once the last sync is older than `millis`
    Interval { millis: u64 },
    /// Left to the OS
    None,
}

impl SyncPolicy {
    fn is_due(&self, pending: usize, last_sync: Instant) -> bool {
        match *self {
            SyncPolicy::Immediate => pending > 0,
            SyncPolicy::EveryN(n) => pending >= n.max(1),
            SyncPolicy::Interval { millis } => {
                pending > 0 && last_sync.elapsed().as_millis() >= u128::from(millis)
            }
            SyncPolicy::None => false,
        }
    }
}

/// Settings of one log node
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub dir: PathBuf,
    pub sync_policy: SyncPolicy,
    /// Segment size that triggers rotation
    pub segment_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

/// A logged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    Insert(TsRecord),
    Update {
        path: SeriesPath,
        range: TimeRange,
        value: Value,
    },
    Delete {
        path: SeriesPath,
        timestamp: Timestamp,
    },
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", id, SEGMENT_SUFFIX))
}

/// Segment files of a node directory by ascending id
fn segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_SUFFIX) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            segments.push((id, path));
        }
    }
    segments.sort_unstable_by_key(|(id, _)| *id);
    Ok(segments)
}
