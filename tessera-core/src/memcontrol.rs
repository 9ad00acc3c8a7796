//! Memory admission control
//!
//! Processors report the estimated size of every memtable write and release
//! it once the memtable is handed to a flush. The controller answers with a
//! usage level that the processors turn into backpressure.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

/// Memory pressure level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsageLevel {
    /// Below the warning threshold
    Safe,
    /// Between the warning and dangerous thresholds; writers flush eagerly
    Warning,
    /// At or above the dangerous threshold; writes are rejected
    Dangerous,
}

/// Record-based memory controller
pub struct MemController {
    warning_threshold: u64,
    dangerous_threshold: u64,
    usage: Mutex<Usage>,
}

#[derive(Default)]
struct Usage {
    total: u64,
    owners: HashMap<String, u64>,
}

impl MemController {
    pub fn new(warning_threshold: u64, dangerous_threshold: u64) -> Self {
        Self {
            warning_threshold,
            dangerous_threshold,
            usage: Mutex::new(Usage::default()),
        }
    }

    /// Ask to hold `bytes` more on behalf of `owner`.
    ///
    /// Safe and Warning answers record the usage; a Dangerous answer does not.
    pub fn acquire_usage(&self, owner: &str, bytes: u64) -> UsageLevel {
        let mut usage = self.usage.lock();
        let next = usage.total.saturating_add(bytes);
        let level = self.level_of(next);
        if level == UsageLevel::Dangerous {
            warn!(
                "Memory usage would reach {} bytes (limit {}), rejecting {} bytes for {}",
                next, self.dangerous_threshold, bytes, owner
            );
            return level;
        }
        usage.total = next;
        *usage.owners.entry(owner.to_string()).or_insert(0) += bytes;
        level
    }

    /// Give back `bytes` previously acquired by `owner`
    pub fn release_usage(&self, owner: &str, bytes: u64) {
        let mut usage = self.usage.lock();
        let released = match usage.owners.get_mut(owner) {
            Some(held) => {
                let released = bytes.min(*held);
                *held -= released;
                if *held == 0 {
                    usage.owners.remove(owner);
                }
                released
            }
            None => 0,
        };
        usage.total = usage.total.saturating_sub(released);
    }

    /// Total bytes currently held
    pub fn total_usage(&self) -> u64 {
        self.usage.lock().total
    }

    /// Bytes held by one owner
    pub fn usage_of(&self, owner: &str) -> u64 {
        self.usage.lock().owners.get(owner).copied().unwrap_or(0)
    }

    /// Level for the current total usage
    pub fn current_level(&self) -> UsageLevel {
        self.level_of(self.total_usage())
    }

    fn level_of(&self, bytes: u64) -> UsageLevel {
        if bytes < self.warning_threshold {
            UsageLevel::Safe
        } else if bytes < self.dangerous_threshold {
            UsageLevel::Warning
        } else {
            UsageLevel::Dangerous
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        let controller = MemController::new(100, 200);

        assert_eq!(controller.acquire_usage("a", 50), UsageLevel::Safe);
        assert_eq!(controller.acquire_usage("b", 60), UsageLevel::Warning);
        assert_eq!(controller.total_usage(), 110);

        // Rejected usage is not recorded
        assert_eq!(controller.acquire_usage("a", 100), UsageLevel::Dangerous);
        assert_eq!(controller.total_usage(), 110);
        assert_eq!(controller.current_level(), UsageLevel::Warning);

        controller.release_usage("b", 60);
        assert_eq!(controller.usage_of("b"), 0);
        assert_eq!(controller.current_level(), UsageLevel::Safe);
    }

    #[test]
    fn test_release_is_bounded_by_owner() {
        let controller = MemController::new(100, 200);
        controller.acquire_usage("a", 30);
        controller.acquire_usage("b", 20);

        controller.release_usage("a", 1000);
        controller.release_usage("missing", 10);
        assert_eq!(controller.total_usage(), 20);
        assert_eq!(controller.usage_of("a"), 0);
    }
}
