//! A named log node bound to one processor

use super::{LogRecord, WalConfig, WalEntry, WalReader, WalWriter};
use crate::{Result, TesseraError};
use parking_lot::Mutex;
use std::fs;
use tracing::{debug, warn};

/// Log node of one processor, e.g. `root.sg1-bufferwrite`
pub struct WriteLogNode {
    name: String,
    config: WalConfig,
    writer: WalWriter,
    state: Mutex<FlushState>,
}

#[derive(Default)]
struct FlushState {
    // first segment not covered by the flush in progress
    boundary: Option<u64>,
    // a flush failed; its records stay until they are replayed
    retain: bool,
}

impl WriteLogNode {
    pub fn open(name: &str, config: WalConfig) -> Result<Self> {
        let writer = WalWriter::open(config.clone())?;
        Ok(Self {
            name: name.to_string(),
            config,
            writer,
            state: Mutex::new(FlushState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a record ahead of the memtable mutation it describes
    pub fn write(&self, record: &LogRecord) -> Result<()> {
        self.writer.append(&WalEntry::new(record)?)
    }

    /// The memtable is about to be frozen: later records go to a new segment
    pub fn notify_start_flush(&self) -> Result<()> {
        let boundary = self.writer.rotate()?;
        self.state.lock().boundary = Some(boundary);
        Ok(())
    }

    /// The frozen memtable is durable (or failed to become so)
    pub fn notify_end_flush(&self, success: bool) -> Result<()> {
        let mut state = self.state.lock();
        let Some(boundary) = state.boundary.take() else {
            return Ok(());
        };
        if !success {
            warn!("Flush of log node {} failed, keeping its records", self.name);
            state.retain = true;
            return Ok(());
        }
        if state.retain {
            return Ok(());
        }
        let removed = self.writer.remove_before(boundary)?;
        debug!("Log node {} dropped {} segments", self.name, removed);
        Ok(())
    }

    /// Records still on disk, oldest first
    pub fn recover(&self) -> Result<Vec<LogRecord>> {
        WalReader::new(&self.config.dir)
            .read_all()?
            .iter()
            .map(|entry| {
                entry.record().map_err(|e| {
                    TesseraError::WalRecovery(format!("log node {}: {}", self.name, e))
                })
            })
            .collect()
    }

    pub fn sync(&self) -> Result<()> {
        self.writer.sync()
    }

    /// Remove every segment of the node; the node must not be written again
    pub fn delete(&self) -> Result<()> {
        if self.config.dir.exists() {
            fs::remove_dir_all(&self.config.dir)?;
        }
        Ok(())
    }
}
