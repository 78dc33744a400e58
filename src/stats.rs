//! I/O statistics counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Byte counters shared by all streams of one kernel instance.
#[derive(Debug)]
pub struct IoStatistics {
    time_created: SystemTime,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl IoStatistics {
    pub(crate) fn new() -> IoStatistics {
        IoStatistics {
            time_created: SystemTime::now(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// When this statistics object was created.
    pub fn time_created(&self) -> SystemTime {
        self.time_created
    }

    /// Total bytes read through accounted streams.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes written through accounted streams.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }
}

/// A snapshot of the manager's gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Live federated file systems known to the manager.
    pub file_systems_total: usize,
    /// Of those, how many currently have a mounted directory.
    pub file_systems_mounted: usize,
    /// Of those, how many carry un-synced changes.
    pub file_systems_touched: usize,
    /// Archives mounted directly on a host file system.
    pub top_level_archives: usize,
}
