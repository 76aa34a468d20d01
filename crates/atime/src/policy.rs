//! Flush sizing.
//!
//! Writeback competes with client I/O for the same spindles, so batch
//! sizes come from two pressures: how full the map is against its cap, and
//! how busy the disks already are. Prefer draining when the disk is idle;
//! accept extra write pressure only when memory pressure demands it;
//! between the watermarks, blend linearly to smooth the transition.

/// Map sizes at or below this are not worth a writeback pass.
pub const FLUSH_THRESHOLD: usize = 4 * 1024;

/// Low watermark on map occupancy, in percent of the configured cap.
pub const MAP_LWM: u64 = 60;

/// High watermark on map occupancy, in percent of the configured cap.
pub const MAP_HWM: u64 = 80;

/// Disk utilization below this counts as idle.
const IDLE_DISK_UTIL: f32 = 50.0;

/// Number of entries a flush pass should write back.
///
/// `max_disk_util` is the maximum `%util` across the disks backing the
/// worker's filesystem, or `None` when the utilization monitor has no
/// answer (then only occupancy drives the decision).
pub fn flush_batch_size(map_size: usize, max_map_size: u64, max_disk_util: Option<f32>) -> usize {
    if map_size <= FLUSH_THRESHOLD {
        return 0;
    }

    let cap = max_map_size.max(1);
    let filling = u64::min(100, map_size as u64 * 100 / cap);

    if matches!(max_disk_util, Some(util) if (0.0..IDLE_DISK_UTIL).contains(&util)) {
        // idle disk: drain opportunistically regardless of occupancy
        return map_size / 4;
    }

    if filling == 100 {
        map_size / 2
    } else if filling > MAP_HWM {
        map_size / 4
    } else if filling > MAP_LWM {
        let weighted =
            (filling - MAP_LWM) as f64 / (MAP_HWM - MAP_LWM) as f64 * map_size as f64;
        weighted as usize / 4
    } else {
        0
    }
}
