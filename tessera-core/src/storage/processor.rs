//! Capabilities shared by the processors of a storage group

use crate::pool::TaskFuture;
use crate::tsfile::ChunkGroupMetadata;
use crate::Result;

/// Which path accepted an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InsertType {
    /// Out-of-order write
    Overflow = 1,
    /// In-order write to the open file's memtable
    BufferWrite = 2,
}

/// Common surface of the buffer-write, overflow and file-node processors
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Start flushing buffered data; the future resolves once it is durable
    fn flush(&mut self) -> Result<TaskFuture<()>>;

    /// Flush, seal and release resources; a second call is a no-op
    fn close(&mut self) -> Result<()>;

    /// Bytes of unflushed data
    fn memory_usage(&self) -> u64;

    /// False while the processor is in use by other work
    fn can_be_closed(&self) -> bool;
}

/// Callbacks from a buffer-write processor to its owner
pub trait FlushListener: Send + Sync {
    /// Memtables are about to be swapped
    fn on_flush_start(&self) -> Result<()>;

    /// Chunk groups of a flush are durable
    fn on_flush_end(&self, groups: &[ChunkGroupMetadata]) -> Result<()>;

    /// The file has been sealed
    fn on_close(&self) -> Result<()>;
}
