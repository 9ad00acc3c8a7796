//! Tessera Core - storage engine of a time-series database
//!
//! Data is partitioned into storage groups. Each group keeps one open
//! columnar file fed by a double-buffered memtable for in-order writes and an
//! overflow store for out-of-order writes, updates and deletes.
//!
//! # Architecture
//!
//! - **FileNodeManager**: registry of storage group processors, global flush
//!   and merge
//! - **FileNodeProcessor**: write routing by per-device high-water-marks,
//!   sealed file list, query source assembly
//! - **BufferWriteProcessor**: memtable swap and background flush into the
//!   open file
//! - **OverflowProcessor**: out-of-order data, merged back by a merge task
//! - **WAL**: one log node per write path, trimmed after every flush
//! - **Readers**: sealed files, open file chunks and memtables merged into one
//!   ordered stream per series

pub mod catalog;
pub mod config;
pub mod memcontrol;
pub mod memtable;
pub mod modification;
pub mod pool;
pub mod query;
pub mod storage;
pub mod tsfile;
pub mod version;
pub mod wal;

mod error;
mod types;

pub use error::{Result, TesseraError};
pub use types::*;

/// Tessera version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
