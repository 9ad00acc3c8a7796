//! Appends framed records to numbered segment files

use super::{segment_path, segments, WalConfig, WalEntry};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

struct ActiveSegment {
    id: u64,
    out: BufWriter<File>,
    size: usize,
    // records written since the last fsync
    pending: usize,
    last_sync: Instant,
}

impl ActiveSegment {
    fn create(dir: &Path, id: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, id))?;
        Ok(Self {
            id,
            out: BufWriter::new(file),
            size: 0,
            pending: 0,
            last_sync: Instant::now(),
        })
    }

    fn sync(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        self.pending = 0;
        self.last_sync = Instant::now();
        Ok(())
    }
}

/// Writer of one log node directory
pub struct WalWriter {
    config: WalConfig,
    active: Mutex<ActiveSegment>,
}

impl WalWriter {
    /// Open the node directory. Writing always starts in a fresh segment, so
    /// a torn tail left by a crash never has records appended behind it.
    pub fn open(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let id = segments(&config.dir)?.last().map_or(0, |(id, _)| id + 1);
        let active = ActiveSegment::create(&config.dir, id)?;
        Ok(Self {
            config,
            active: Mutex::new(active),
        })
    }

    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let frame = entry.encode();
        let mut active = self.active.lock();
        if active.size > 0 && active.size + frame.len() > self.config.segment_size {
            self.roll(&mut active)?;
        }
        active.out.write_all(&frame)?;
        active.size += frame.len();
        active.pending += 1;
        if self.config.sync_policy.is_due(active.pending, active.last_sync) {
            active.sync()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.active.lock().sync()
    }

    pub fn segment_id(&self) -> u64 {
        self.active.lock().id
    }

    /// Start a new segment and return its id; every record appended before
    /// the call lives in a lower segment
    pub fn rotate(&self) -> Result<u64> {
        let mut active = self.active.lock();
        self.roll(&mut active)?;
        Ok(active.id)
    }

    /// Delete the segments with an id below `id`
    pub fn remove_before(&self, id: u64) -> Result<usize> {
        let mut removed = 0;
        for (segment, path) in segments(&self.config.dir)? {
            if segment >= id {
                break;
            }
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn roll(&self, active: &mut ActiveSegment) -> Result<()> {
        active.sync()?;
        *active = ActiveSegment::create(&self.config.dir, active.id + 1)?;
        Ok(())
    }
}
