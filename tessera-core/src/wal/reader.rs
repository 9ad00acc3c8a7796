//! Reads the surviving segments of a log node after a restart

use super::{segments, Decoded, WalEntry};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Every readable entry, oldest segment first. A segment is read up to
    /// its first torn or corrupt frame.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        for (_, path) in segments(&self.dir)? {
            let before = entries.len();
            read_segment(&path, &mut entries)?;
            debug!("Read {} entries from {:?}", entries.len() - before, path);
        }
        Ok(entries)
    }
}

fn read_segment(path: &Path, entries: &mut Vec<WalEntry>) -> Result<()> {
    let data = fs::read(path)?;
    let mut offset = 0;
    while offset < data.len() {
        match WalEntry::decode(&data[offset..]) {
            Decoded::Entry(entry, used) => {
                entries.push(entry);
                offset += used;
            }
            Decoded::Torn => {
                warn!("Torn entry at offset {} of {:?}", offset, path);
                break;
            }
            Decoded::Corrupt(reason) => {
                warn!("Corrupt entry at offset {} of {:?}: {}", offset, path, reason);
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{LogRecord, SyncPolicy, WalConfig, WalWriter};
    use crate::TsRecord;
    use std::io::Write;
    use tempfile::TempDir;

    fn insert(ts: i64) -> WalEntry {
        let record = LogRecord::Insert(TsRecord::new("root.sg.d1", ts).with_point("s1", ts));
        WalEntry::new(&record).unwrap()
    }

    #[test]
    fn test_reads_across_segments() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: temp_dir.path().to_path_buf(),
            sync_policy: SyncPolicy::None,
            segment_size: 128,
        };
        {
            let writer = WalWriter::open(config).unwrap();
            for ts in 0..10 {
                writer.append(&insert(ts)).unwrap();
            }
            writer.sync().unwrap();
            assert!(writer.segment_id() > 0);
        }

        let entries = WalReader::new(temp_dir.path()).read_all().unwrap();
        let times: Vec<i64> = entries
            .iter()
            .map(|e| match e.record().unwrap() {
                LogRecord::Insert(record) => record.timestamp,
                other => panic!("unexpected record {:?}", other),
            })
            .collect();
        assert_eq!(times, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_stops_at_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        {
            let config = WalConfig {
                dir: temp_dir.path().to_path_buf(),
                ..Default::default()
            };
            let writer = WalWriter::open(config).unwrap();
            writer.append(&insert(1)).unwrap();
        }

        let (_, path) = segments(temp_dir.path()).unwrap().remove(0);
        let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();

        assert_eq!(WalReader::new(temp_dir.path()).read_all().unwrap().len(), 1);
    }
}
