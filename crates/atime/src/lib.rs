//! Access-time tracking for the tidemark storage target.
//!
//! The data filesystems are mounted `noatime`, so the kernel never records
//! when an object was last read, but LRU eviction needs exactly that. This
//! crate keeps the target's own access times: every object read issues a
//! [`AtimeTracker::touch`], which lands in an in-memory map owned by a
//! per-mountpath worker, and a periodic flush writes the cached times back
//! to disk with explicit set-times calls. Flush batches are sized from map
//! occupancy watermarks and live disk utilization so that writeback yields
//! to client I/O.
//!
//! Construction follows the actor shape used across the workspace:
//! [`AtimeRunner::new`] returns a clonable [`AtimeTracker`] handle plus the
//! runner to spawn.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tidemark_atime::{AtimeConfig, AtimeRunner};
//! use tidemark_fs::MountedFs;
//! use tidemark_iostat::DiskUtilMonitor;
//!
//! # async fn example() -> Result<(), tidemark_fs::FsError> {
//! let mounts = Arc::new(MountedFs::new());
//! mounts.add("/mnt/a")?;
//!
//! let monitor = DiskUtilMonitor::new(Duration::from_secs(10));
//! tokio::spawn(monitor.clone().run());
//!
//! let (tracker, runner) =
//!     AtimeRunner::new(mounts, Arc::new(monitor), AtimeConfig::default());
//! tokio::spawn(runner.run());
//!
//! tracker.touch("/mnt/a/bucket/obj").await;
//! let mut reply = tracker.atime("/mnt/a/bucket/obj").await;
//! let response = reply.recv().await.expect("one response per query");
//! # let _ = response;
//! # Ok(())
//! # }
//! ```
//!
//! Access times are an approximation: the in-memory buffer is lost on
//! crash and deliberately discarded on [`AtimeTracker::stop`].
//! Losing at most one flush interval of updates only blurs LRU ordering,
//! while a shutdown path that waits on disk writes would hold up the whole
//! target.

use std::time::SystemTime;

mod config;
mod dispatcher;
mod metrics;
mod policy;
mod worker;

pub use config::{AtimeConfig, DEFAULT_FLUSH_PERIOD, DEFAULT_MAX_MAP_SIZE};
pub use dispatcher::{AtimeRunner, AtimeTracker, TrackerStopped};
pub use metrics::MetricsSnapshot;
pub use policy::{flush_batch_size, FLUSH_THRESHOLD, MAP_HWM, MAP_LWM};

/// Answer to one [`AtimeTracker::atime`] query, delivered exactly once on
/// the reply channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Most recent cached access time, or `None` when the object has no
    /// entry (never touched, already flushed, or outside any mountpath).
    pub atime: Option<SystemTime>,
}

impl Response {
    pub(crate) fn found(atime: SystemTime) -> Self {
        Self { atime: Some(atime) }
    }

    pub(crate) fn absent() -> Self {
        Self { atime: None }
    }

    pub fn is_present(&self) -> bool {
        self.atime.is_some()
    }
}
