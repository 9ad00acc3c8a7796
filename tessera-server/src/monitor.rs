//! Background tasks of the daemon

use std::sync::Arc;
use std::time::Duration;
use tessera_core::memcontrol::UsageLevel;
use tessera_core::storage::FileNodeManager;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Sample memory usage and force flushes according to its level
pub fn spawn_memory_monitor(manager: Arc<FileNodeManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let level = manager.context().mem.current_level();
            if level != UsageLevel::Safe {
                warn!(
                    "Memtables hold {} bytes ({:?})",
                    manager.context().mem.total_usage(),
                    level
                );
            }
            let flushing = manager.clone();
            match tokio::task::spawn_blocking(move || flushing.force_flush(level)).await {
                Ok(Ok(count)) => debug!("Memory monitor flushed {} storage groups", count),
                Ok(Err(e)) => error!("Forced flush failed: {}", e),
                Err(e) => error!("Forced flush task panicked: {}", e),
            }
        }
    })
}

/// Run a global merge every `period`
pub fn spawn_periodic_merge(manager: Arc<FileNodeManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let merging = manager.clone();
            match tokio::task::spawn_blocking(move || merging.merge_all()).await {
                Ok(Ok(())) => debug!("Periodic merge done"),
                Ok(Err(e)) => error!("Periodic merge failed: {}", e),
                Err(e) => error!("Periodic merge task panicked: {}", e),
            }
        }
    })
}
