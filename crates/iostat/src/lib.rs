//! Disk utilization sampling for the tidemark storage target.
//!
//! The data path needs to know how busy the disks behind a filesystem are
//! so that background writeback can yield to client I/O. [`DiskUtilMonitor`]
//! samples `/proc/diskstats` on a fixed period and keeps the last computed
//! `%util` per disk; consumers read it through the [`UtilizationOracle`]
//! trait, which is synchronous and never touches the disk itself.
//!
//! Capacity queries are `statvfs`-based: see [`fs_stats`] and
//! [`fs_used_percentage`].

mod capacity;
mod monitor;

pub use capacity::{fs_stats, fs_used_percentage, FsCapacity};
pub use monitor::DiskUtilMonitor;

/// Read side of disk utilization, keyed by filesystem id.
///
/// Implementations must be cheap: this is called from flush sizing on
/// every writeback decision, with no I/O allowed behind it.
pub trait UtilizationOracle: Send + Sync {
    /// Maximum `%util` (0..=100) across the disks backing `fs` over the
    /// last sampling interval, or `None` when the filesystem is unknown or
    /// has not been sampled yet.
    fn max_util_fs(&self, fs: &str) -> Option<f32>;
}
