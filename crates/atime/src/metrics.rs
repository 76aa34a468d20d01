//! Tracker counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters, updated by every worker and snapshotted through the
/// tracker handle.
#[derive(Debug, Default)]
pub(crate) struct AtimeMetrics {
    touches: AtomicU64,
    queries: AtomicU64,
    hits: AtomicU64,
    flushed: AtomicU64,
    evicted_missing: AtomicU64,
    cached: AtomicU64,
}

impl AtimeMetrics {
    pub(crate) fn record_touch(&self, new_entry: bool) {
        self.touches.fetch_add(1, Ordering::Relaxed);
        if new_entry {
            self.cached.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_query(&self, hit: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_flushed(&self) {
        self.flushed.fetch_add(1, Ordering::Relaxed);
        self.cached.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted_missing(&self) {
        self.evicted_missing.fetch_add(1, Ordering::Relaxed);
        self.cached.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            touches: self.touches.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            evicted_missing: self.evicted_missing.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the tracker counters, summed over all mountpaths.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    /// Touch requests applied to a map.
    pub touches: u64,
    /// Atime queries served.
    pub queries: u64,
    /// Queries that found a cached entry.
    pub hits: u64,
    /// Entries written back to disk.
    pub flushed: u64,
    /// Entries dropped because the object vanished before writeback.
    pub evicted_missing: u64,
    /// Entries currently cached.
    pub cached: u64,
}
