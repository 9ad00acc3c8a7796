//! Error types for Tessera

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Tessera error types
#[derive(Error, Debug)]
pub enum TesseraError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Write carried a timestamp the engine cannot accept
    #[error("Invalid timestamp {timestamp} for device {device}")]
    InvalidTimestamp { device: String, timestamp: i64 },

    /// No storage group covers the path
    #[error("Storage group not found for path: {0}")]
    StorageGroupNotFound(String),

    /// Value does not match the series data type
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Memory admission control refused the write
    #[error("Write rejected by memory control: {0}")]
    Rejected(String),

    /// Processor already closed
    #[error("Processor closed: {0}")]
    Closed(String),

    /// Resource is locked by another operation
    #[error("Busy: {0}")]
    Busy(String),

    /// Operation conflicts with the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Error raised inside one storage group
    #[error("Storage group {name}: {source}")]
    StorageGroup {
        name: String,
        #[source]
        source: Box<TesseraError>,
    },

    /// Background task failed
    #[error("Background task failed: {0}")]
    Task(Arc<TesseraError>),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// WAL recovery error
    #[error("WAL recovery error: {0}")]
    WalRecovery(String),

    /// Merge error
    #[error("Merge error: {0}")]
    Merge(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Wrap an error with the storage group it came from
    pub fn in_storage_group(self, name: &str) -> Self {
        match self {
            e @ TesseraError::StorageGroup { .. } => e,
            e => TesseraError::StorageGroup {
                name: name.to_string(),
                source: Box::new(e),
            },
        }
    }

    /// Innermost error, looking through storage group and task wrappers
    pub fn root(&self) -> &TesseraError {
        match self {
            TesseraError::StorageGroup { source, .. } => source.root(),
            TesseraError::Task(inner) => inner.root(),
            e => e,
        }
    }

    /// True if the operation may succeed once the processor is idle
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), TesseraError::Busy(_))
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(e: bincode::Error) -> Self {
        TesseraError::InvalidFormat(e.to_string())
    }
}
