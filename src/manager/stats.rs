//! Aggregate counters over the manager's records.

use std::fmt;

use crate::transfer::{TransferRecord, TransferStatus};

/// Snapshot of counts by status plus byte totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerStatistics {
    pub total: usize,
    pub pending: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Sum of the current speed of every downloading record.
    pub speed_bytes_per_sec: f64,
}

impl ManagerStatistics {
    /// Builds statistics from a record set.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TransferRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            stats.total_bytes += record.total_bytes;
            stats.downloaded_bytes += record.downloaded_bytes;
            match record.status {
                TransferStatus::Pending => stats.pending += 1,
                TransferStatus::Downloading => {
                    stats.downloading += 1;
                    stats.speed_bytes_per_sec += record.speed_bytes_per_sec;
                }
                TransferStatus::Paused => stats.paused += 1,
                TransferStatus::Completed => stats.completed += 1,
                TransferStatus::Failed => stats.failed += 1,
                TransferStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

impl fmt::Display for ManagerStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} transfers: {} completed, {} failed, {} cancelled, {} paused, {} pending, {} downloading ({}/{} bytes)",
            self.total,
            self.completed,
            self.failed,
            self.cancelled,
            self.paused,
            self.pending,
            self.downloading,
            self.downloaded_bytes,
            self.total_bytes
        )
    }
}
