//! Periodic `/proc/diskstats` sampler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::UtilizationOracle;

const DISKSTATS: &str = "/proc/diskstats";
const SYS_BLOCK: &str = "/sys/block";

/// One parsed `/proc/diskstats` snapshot: device name to milliseconds the
/// device spent doing I/O since boot (field 10 of the per-device stats).
type IoTicks = HashMap<String, u64>;

struct Sample {
    at: Instant,
    io_ticks_ms: IoTicks,
}

struct Inner {
    period: Duration,
    stopped: AtomicBool,
    /// disk -> %util over the last completed interval
    utils: RwLock<HashMap<String, f32>>,
    /// filesystem id -> disks backing it
    fs_disks: RwLock<HashMap<String, Vec<String>>>,
    prev: Mutex<Option<Sample>>,
}

/// Samples disk business on a fixed period and answers max-utilization
/// queries per filesystem.
///
/// The monitor is a cheap clonable handle; spawn [`DiskUtilMonitor::run`]
/// once and share clones with every consumer.
#[derive(Clone)]
pub struct DiskUtilMonitor {
    inner: Arc<Inner>,
}

impl DiskUtilMonitor {
    pub fn new(period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                period,
                stopped: AtomicBool::new(false),
                utils: RwLock::new(HashMap::new()),
                fs_disks: RwLock::new(HashMap::new()),
                prev: Mutex::new(None),
            }),
        }
    }

    /// Map a filesystem id to its backing disks by scanning the block
    /// device tree. Falls back to the device name itself when the tree
    /// yields nothing.
    pub fn register_filesystem(&self, fs: &str) {
        let disks = disks_for_filesystem(fs);
        if disks.is_empty() {
            warn!(fs = %fs, "no disks found for filesystem");
        }
        self.register_filesystem_disks(fs, disks);
    }

    /// Map a filesystem id to an explicit disk set. Test seam and escape
    /// hatch for layouts the block-device scan cannot express.
    pub fn register_filesystem_disks(&self, fs: &str, disks: Vec<String>) {
        debug!(fs = %fs, disks = ?disks, "registering filesystem disks");
        self.inner.fs_disks.write().insert(fs.to_string(), disks);
    }

    pub fn unregister_filesystem(&self, fs: &str) {
        self.inner.fs_disks.write().remove(fs);
    }

    /// Sample until [`stop`](Self::stop) is called. Spawn this on the
    /// runtime; the handle stays usable from other tasks.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.inner.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.inner.stopped.load(Ordering::Relaxed) {
                debug!("disk utilization monitor stopping");
                return;
            }
            self.sample_once();
        }
    }

    /// Request the sampling loop to exit at its next tick.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
    }

    fn sample_once(&self) {
        match std::fs::read_to_string(DISKSTATS) {
            Ok(content) => self.apply(parse_diskstats(&content), Instant::now()),
            Err(err) => warn!(error = %err, "failed to read {DISKSTATS}"),
        }
    }

    /// Fold one snapshot into the per-disk utilization table. `%util` is
    /// the share of wall time the device was busy since the previous
    /// snapshot, clamped to 100.
    fn apply(&self, io_ticks_ms: IoTicks, at: Instant) {
        let mut prev = self.inner.prev.lock();
        if let Some(last) = prev.as_ref() {
            let elapsed_ms = at.duration_since(last.at).as_millis() as u64;
            if elapsed_ms > 0 {
                let mut utils = self.inner.utils.write();
                for (disk, ticks) in &io_ticks_ms {
                    let Some(prev_ticks) = last.io_ticks_ms.get(disk) else {
                        continue;
                    };
                    let busy_ms = ticks.saturating_sub(*prev_ticks);
                    let util = (busy_ms as f32 * 100.0 / elapsed_ms as f32).min(100.0);
                    utils.insert(disk.clone(), util);
                }
            }
        }
        *prev = Some(Sample { at, io_ticks_ms });
    }
}

impl UtilizationOracle for DiskUtilMonitor {
    fn max_util_fs(&self, fs: &str) -> Option<f32> {
        let fs_disks = self.inner.fs_disks.read();
        let disks = fs_disks.get(fs)?;
        let utils = self.inner.utils.read();
        disks
            .iter()
            .filter_map(|d| utils.get(d).copied())
            .reduce(f32::max)
    }
}

/// Parse `/proc/diskstats` into io-ticks per device.
fn parse_diskstats(content: &str) -> IoTicks {
    let mut ticks = IoTicks::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // major minor name + at least the 11 classic stat fields
        if fields.len() < 14 {
            continue;
        }
        let Ok(io_ticks_ms) = fields[12].parse::<u64>() else {
            continue;
        };
        ticks.insert(fields[2].to_string(), io_ticks_ms);
    }
    ticks
}

/// The whole disks backing a device: the device itself when it is a whole
/// disk, or its parent when it is a partition (partition entries live
/// inside the parent's `/sys/block` directory).
fn disks_for_filesystem(fs: &str) -> Vec<String> {
    let device = fs.trim_start_matches("/dev/");
    let Ok(entries) = std::fs::read_dir(SYS_BLOCK) else {
        return vec![device.to_string()];
    };
    let mut disks = Vec::new();
    for entry in entries.flatten() {
        let base = entry.file_name().to_string_lossy().into_owned();
        if base == device || Path::new(SYS_BLOCK).join(&base).join(device).is_dir() {
            disks.push(base);
        }
    }
    if disks.is_empty() {
        disks.push(device.to_string());
    }
    disks
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT_A: &str = "\
   8       0 sda 4325 0 188662 2926 10449 3255 1005634 32550 0 6120 35476 0 0 0 0 0 0
   8       1 sda1 4000 0 180000 2800 10000 3000 1000000 32000 0 6000 34800 0 0 0 0 0 0
 259       0 nvme0n1 9387 12 661520 4100 22000 900 2203000 61200 0 9800 65300 0 0 0 0 0 0
";

    fn snapshot(sda_ticks: u64, nvme_ticks: u64) -> IoTicks {
        IoTicks::from([
            ("sda".to_string(), sda_ticks),
            ("nvme0n1".to_string(), nvme_ticks),
        ])
    }

    #[test]
    fn test_parse_diskstats() {
        let ticks = parse_diskstats(SNAPSHOT_A);
        assert_eq!(ticks.get("sda"), Some(&6120));
        assert_eq!(ticks.get("sda1"), Some(&6000));
        assert_eq!(ticks.get("nvme0n1"), Some(&9800));
        assert_eq!(ticks.len(), 3);

        assert!(parse_diskstats("garbage line\n").is_empty());
    }

    #[test]
    fn test_util_from_tick_deltas() {
        let monitor = DiskUtilMonitor::new(Duration::from_secs(1));
        monitor.register_filesystem_disks("/dev/sda1", vec!["sda".to_string()]);
        monitor.register_filesystem_disks("/dev/nvme0n1p1", vec!["nvme0n1".to_string()]);

        let start = Instant::now();
        monitor.apply(snapshot(1_000, 5_000), start);
        // busy 250ms and 900ms out of 1000ms
        monitor.apply(
            snapshot(1_250, 5_900),
            start + Duration::from_millis(1_000),
        );

        let sda = monitor.max_util_fs("/dev/sda1").unwrap();
        assert!((sda - 25.0).abs() < 0.01, "sda util was {sda}");
        let nvme = monitor.max_util_fs("/dev/nvme0n1p1").unwrap();
        assert!((nvme - 90.0).abs() < 0.01, "nvme util was {nvme}");
    }

    #[test]
    fn test_util_is_clamped_to_100() {
        let monitor = DiskUtilMonitor::new(Duration::from_secs(1));
        monitor.register_filesystem_disks("fs", vec!["sda".to_string()]);

        let start = Instant::now();
        monitor.apply(snapshot(0, 0), start);
        // counter advanced further than wall time (multi-queue devices do this)
        monitor.apply(snapshot(5_000, 0), start + Duration::from_millis(1_000));

        assert_eq!(monitor.max_util_fs("fs"), Some(100.0));
    }

    #[test]
    fn test_max_across_disks() {
        let monitor = DiskUtilMonitor::new(Duration::from_secs(1));
        monitor.register_filesystem_disks(
            "raid",
            vec!["sda".to_string(), "nvme0n1".to_string()],
        );

        let start = Instant::now();
        monitor.apply(snapshot(0, 0), start);
        monitor.apply(snapshot(100, 700), start + Duration::from_millis(1_000));

        assert_eq!(monitor.max_util_fs("raid"), Some(70.0));
    }

    #[test]
    fn test_unknown_or_unsampled_fs_is_absent() {
        let monitor = DiskUtilMonitor::new(Duration::from_secs(1));
        assert_eq!(monitor.max_util_fs("nope"), None);

        // registered but only one snapshot taken: no interval to rate over
        monitor.register_filesystem_disks("fs", vec!["sda".to_string()]);
        monitor.apply(snapshot(1_000, 0), Instant::now());
        assert_eq!(monitor.max_util_fs("fs"), None);
    }
}
