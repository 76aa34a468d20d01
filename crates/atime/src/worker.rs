//! Per-mountpath atime worker.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use tidemark_fs::{times, MountpathInfo};
use tidemark_iostat::UtilizationOracle;

use crate::config::AtimeConfig;
use crate::metrics::AtimeMetrics;
use crate::policy;
use crate::Response;

/// Touch buffer depth per worker. Touches beyond this back-pressure the
/// dispatcher while the worker is busy writing back.
pub(crate) const SET_CHANNEL_CAPACITY: usize = 256;

/// Record `path` as accessed at `atime`. Last writer wins.
pub(crate) struct SetRequest {
    pub path: String,
    pub atime: SystemTime,
}

/// Look up the cached access time of `path` and answer on `reply`.
pub(crate) struct GetRequest {
    pub path: String,
    pub reply: mpsc::Sender<Response>,
}

/// Sender side of one worker, held by the dispatcher.
pub(crate) struct WorkerHandle {
    set_tx: mpsc::Sender<SetRequest>,
    get_tx: mpsc::Sender<GetRequest>,
    flush_tx: mpsc::Sender<usize>,
    stop_tx: mpsc::Sender<()>,
}

impl WorkerHandle {
    pub(crate) async fn set(&self, request: SetRequest) {
        let _ = self.set_tx.send(request).await;
    }

    pub(crate) async fn get(&self, request: GetRequest) {
        let _ = self.get_tx.send(request).await;
    }

    /// Hand the worker a flush signal; `0` means size the batch from the
    /// utilization policy. Returns false when the worker is still busy with
    /// the previous flush, in which case the signal is skipped so one slow
    /// disk cannot stall the dispatcher.
    pub(crate) fn try_flush(&self, n: usize) -> bool {
        self.flush_tx.try_send(n).is_ok()
    }

    /// Ask the worker to exit. An in-progress writeback completes first;
    /// whatever is still cached is discarded.
    pub(crate) fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// Owner of the path→atime map for one mountpath.
///
/// The map is touched only from [`run`](Self::run), one request at a time,
/// so it needs no lock. Writeback happens inline in the flush branch: the
/// worker deliberately blocks its own loop (touches queue in the set
/// channel, queries wait) while other mountpaths keep running on their own
/// workers.
pub(crate) struct MpathWorker {
    mpath: String,
    file_system: String,
    atimemap: HashMap<String, SystemTime>,
    set_rx: mpsc::Receiver<SetRequest>,
    get_rx: mpsc::Receiver<GetRequest>,
    flush_rx: mpsc::Receiver<usize>,
    stop_rx: mpsc::Receiver<()>,
    max_map_size: Arc<AtomicU64>,
    oracle: Arc<dyn UtilizationOracle>,
    metrics: Arc<AtimeMetrics>,
}

impl MpathWorker {
    pub(crate) fn new(
        info: &MountpathInfo,
        config: &AtimeConfig,
        oracle: Arc<dyn UtilizationOracle>,
        metrics: Arc<AtimeMetrics>,
    ) -> (WorkerHandle, MpathWorker) {
        let (set_tx, set_rx) = mpsc::channel(SET_CHANNEL_CAPACITY);
        let (get_tx, get_rx) = mpsc::channel(1);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = WorkerHandle {
            set_tx,
            get_tx,
            flush_tx,
            stop_tx,
        };
        let worker = MpathWorker {
            mpath: info.path.clone(),
            file_system: info.file_system.clone(),
            atimemap: HashMap::new(),
            set_rx,
            get_rx,
            flush_rx,
            stop_rx,
            max_map_size: Arc::clone(&config.max_map_size),
            oracle,
            metrics,
        };
        (handle, worker)
    }

    pub(crate) async fn run(mut self) {
        debug!(mpath = %self.mpath, "atime worker started");
        loop {
            // Biased: queued touches are applied before any query, so a
            // caller whose touch was dispatched always reads its own write
            // (or a newer one) from the same worker.
            tokio::select! {
                biased;
                _ = self.stop_rx.recv() => {
                    debug!(mpath = %self.mpath, "atime worker stopping");
                    return;
                }
                Some(request) = self.set_rx.recv() => self.handle_set(request),
                Some(request) = self.get_rx.recv() => self.handle_get(request).await,
                Some(n) = self.flush_rx.recv() => self.handle_flush(n),
                else => return,
            }
        }
    }

    fn handle_set(&mut self, request: SetRequest) {
        let new_entry = self.atimemap.insert(request.path, request.atime).is_none();
        self.metrics.record_touch(new_entry);
    }

    async fn handle_get(&self, request: GetRequest) {
        let response = match self.atimemap.get(&request.path) {
            Some(&atime) => Response::found(atime),
            None => Response::absent(),
        };
        self.metrics.record_query(response.is_present());
        // the caller may have abandoned the reply channel; their call
        let _ = request.reply.send(response).await;
    }

    /// Write back up to `n` entries, removing each one that was either
    /// persisted or found to be gone. `n == 0` sizes the batch from the
    /// utilization policy; transient errors leave the entry in place for a
    /// later flush.
    pub(crate) fn handle_flush(&mut self, n: usize) {
        let n = if n == 0 { self.batch_size() } else { n };
        if n == 0 {
            return;
        }
        let paths: Vec<String> = self.atimemap.keys().cloned().collect();
        let mut done = 0;
        for path in paths {
            if done >= n {
                break;
            }
            let Some(&atime) = self.atimemap.get(&path) else {
                continue;
            };
            match write_back(&path, atime) {
                WriteBack::Persisted => {
                    self.atimemap.remove(&path);
                    self.metrics.record_flushed();
                    done += 1;
                }
                WriteBack::Missing => {
                    self.atimemap.remove(&path);
                    self.metrics.record_evicted_missing();
                    done += 1;
                }
                WriteBack::Retry => {}
            }
        }
        trace!(mpath = %self.mpath, flushed = done, cached = self.atimemap.len(), "flush pass done");
    }

    fn batch_size(&self) -> usize {
        let cap = self.max_map_size.load(Ordering::Relaxed);
        let util = self.oracle.max_util_fs(&self.file_system);
        policy::flush_batch_size(self.atimemap.len(), cap, util)
    }
}

enum WriteBack {
    /// Times written; drop the entry.
    Persisted,
    /// Object no longer exists; drop the entry.
    Missing,
    /// Transient failure; keep the entry for the next flush.
    Retry,
}

fn write_back(path: &str, atime: SystemTime) -> WriteBack {
    let fs_path = Path::new(path);
    let mtime = match times::modification_time(fs_path) {
        Ok(mtime) => mtime,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return WriteBack::Missing,
        Err(err) => {
            warn!(path = %path, error = %err, "failed to stat object for atime writeback");
            return WriteBack::Retry;
        }
    };
    // only the access time moves; the modification time is written back
    // unchanged
    match times::set_times(fs_path, atime, mtime) {
        Ok(()) => {
            trace!(path = %path, ?atime, "access time written back");
            WriteBack::Persisted
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => WriteBack::Missing,
        Err(err) => {
            warn!(path = %path, error = %err, "failed to write back access time");
            WriteBack::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FixedUtil(Option<f32>);

    impl UtilizationOracle for FixedUtil {
        fn max_util_fs(&self, _fs: &str) -> Option<f32> {
            self.0
        }
    }

    fn test_worker(mpath: &str, util: Option<f32>, max_map_size: u64) -> MpathWorker {
        let info = MountpathInfo {
            path: mpath.to_string(),
            file_system: "testfs".to_string(),
        };
        let config = AtimeConfig::with_max_map_size(max_map_size);
        let (_handle, worker) = MpathWorker::new(
            &info,
            &config,
            Arc::new(FixedUtil(util)),
            Arc::new(AtimeMetrics::default()),
        );
        // _handle is dropped; tests drive the worker directly
        worker
    }

    fn unix(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_flush_writes_back_and_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("obj");
        std::fs::write(&obj, b"payload").unwrap();
        let mtime_before = times::modification_time(&obj).unwrap();

        let mut worker = test_worker(dir.path().to_str().unwrap(), None, 1024);
        let obj_key = obj.to_str().unwrap().to_string();
        let atime = unix(1_700_000_000);
        worker.atimemap.insert(obj_key, atime);

        worker.handle_flush(1);

        assert!(worker.atimemap.is_empty());
        let (got_atime, got_mtime) = times::times_of(&obj).unwrap();
        assert_eq!(got_atime, atime);
        let drift = got_mtime
            .duration_since(mtime_before)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1), "mtime drifted by {drift:?}");
    }

    #[test]
    fn test_flush_evicts_missing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = test_worker(dir.path().to_str().unwrap(), None, 1024);
        let gone = dir.path().join("gone").to_str().unwrap().to_string();
        worker.atimemap.insert(gone, unix(1_700_000_000));

        worker.handle_flush(1);

        assert!(worker.atimemap.is_empty());
    }

    #[test]
    fn test_flush_is_bounded_by_n() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = test_worker(dir.path().to_str().unwrap(), None, 1024);
        for i in 0..5 {
            let path = dir.path().join(format!("obj{i}"));
            std::fs::write(&path, b"x").unwrap();
            worker
                .atimemap
                .insert(path.to_str().unwrap().to_string(), unix(1_700_000_000 + i));
        }

        worker.handle_flush(2);
        assert_eq!(worker.atimemap.len(), 3);

        worker.handle_flush(2);
        assert_eq!(worker.atimemap.len(), 1);
    }

    #[test]
    fn test_flush_with_n_at_least_size_empties_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = test_worker(dir.path().to_str().unwrap(), None, 1024);
        for i in 0..8 {
            let path = dir.path().join(format!("obj{i}"));
            std::fs::write(&path, b"x").unwrap();
            worker
                .atimemap
                .insert(path.to_str().unwrap().to_string(), unix(1_700_000_000 + i));
        }

        worker.handle_flush(worker.atimemap.len());
        assert!(worker.atimemap.is_empty());
    }

    #[test]
    fn test_policy_sized_flush_below_threshold_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = test_worker(dir.path().to_str().unwrap(), Some(0.0), 1024);
        let obj = dir.path().join("obj");
        std::fs::write(&obj, b"x").unwrap();
        worker
            .atimemap
            .insert(obj.to_str().unwrap().to_string(), unix(1_700_000_000));

        worker.handle_flush(0);
        assert_eq!(worker.atimemap.len(), 1);
    }

    #[test]
    fn test_policy_sized_flush_drains_quarter_on_idle_disk() {
        let dir = tempfile::tempdir().unwrap();
        let size = policy::FLUSH_THRESHOLD + 904; // 5000 entries
        let mut worker = test_worker(dir.path().to_str().unwrap(), Some(10.0), 10_000);
        for i in 0..size {
            // nonexistent objects: every writeback attempt evicts
            let path = dir.path().join(format!("obj{i}"));
            worker
                .atimemap
                .insert(path.to_str().unwrap().to_string(), unix(1_700_000_000));
        }

        worker.handle_flush(0);
        assert_eq!(worker.atimemap.len(), size - size / 4);
    }
}
