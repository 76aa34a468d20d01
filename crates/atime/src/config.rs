//! Tracker configuration.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between flush ticks.
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Default soft cap on entries cached per mountpath.
pub const DEFAULT_MAX_MAP_SIZE: u64 = 1024 * 1024;

/// Configuration for an [`AtimeRunner`](crate::AtimeRunner).
#[derive(Debug, Clone)]
pub struct AtimeConfig {
    /// Interval between flush signals fanned out to every worker.
    pub flush_period: Duration,

    /// Soft cap on each worker's map size, driving the flush watermarks.
    /// Shared and atomic so operators can retune it at runtime without
    /// restarting workers; each flush reads a fresh snapshot.
    pub max_map_size: Arc<AtomicU64>,
}

impl Default for AtimeConfig {
    fn default() -> Self {
        Self::with_max_map_size(DEFAULT_MAX_MAP_SIZE)
    }
}

impl AtimeConfig {
    pub fn with_max_map_size(max_map_size: u64) -> Self {
        Self {
            flush_period: DEFAULT_FLUSH_PERIOD,
            max_map_size: Arc::new(AtomicU64::new(max_map_size)),
        }
    }
}
