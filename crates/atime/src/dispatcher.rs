//! The tracker handle and the dispatching runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tidemark_fs::{MountedFs, MountpathEvent, MountpathInfo};
use tidemark_iostat::UtilizationOracle;

use crate::config::AtimeConfig;
use crate::metrics::AtimeMetrics;
use crate::worker::{GetRequest, MpathWorker, SetRequest, WorkerHandle};
use crate::{MetricsSnapshot, Response};

/// The request ingress is the admission-control point: a single slot, so
/// producers back-pressure against the dispatcher instead of piling up.
const REQUEST_CHANNEL_CAPACITY: usize = 1;

const MPATH_CHANNEL_CAPACITY: usize = 1;

/// Returned by lifecycle requests after the runner has exited.
#[derive(Debug, thiserror::Error)]
#[error("atime tracker has been stopped")]
pub struct TrackerStopped;

pub(crate) enum Request {
    Touch { mpath: String, set: SetRequest },
    Query { mpath: String, get: GetRequest },
}

/// Clonable client of the atime subsystem.
///
/// All methods route through the runner; none of them performs I/O.
#[derive(Clone)]
pub struct AtimeTracker {
    request_tx: mpsc::Sender<Request>,
    mpath_tx: mpsc::Sender<MountpathEvent>,
    stop_tx: mpsc::Sender<()>,
    mounts: Arc<MountedFs>,
    metrics: Arc<AtimeMetrics>,
}

impl AtimeTracker {
    /// Record that `path` was accessed now.
    ///
    /// Fire-and-forget: a path outside every mountpath is silently
    /// dropped, and no error ever reaches the caller.
    pub async fn touch(&self, path: &str) {
        self.touch_at(path, SystemTime::now()).await;
    }

    /// Record that `path` was accessed at `atime`.
    pub async fn touch_at(&self, path: &str, atime: SystemTime) {
        let Some(info) = self.mounts.resolve(path) else {
            return;
        };
        let request = Request::Touch {
            mpath: info.path.clone(),
            set: SetRequest {
                path: path.to_string(),
                atime,
            },
        };
        // runner already stopped: the touch is dropped, per the contract
        let _ = self.request_tx.send(request).await;
    }

    /// Query the cached access time of `path`.
    ///
    /// Returns a fresh reply channel carrying exactly one [`Response`].
    /// Callers issuing many queries can reuse their own channel through
    /// [`atime_into`](Self::atime_into) instead.
    pub async fn atime(&self, path: &str) -> mpsc::Receiver<Response> {
        let (reply_tx, reply_rx) = mpsc::channel(1);
        self.atime_into(path, reply_tx).await;
        reply_rx
    }

    /// Query the cached access time of `path`, answering on a
    /// caller-supplied channel. Exactly one [`Response`] is delivered per
    /// call; a path outside every mountpath answers absent immediately.
    pub async fn atime_into(&self, path: &str, reply: mpsc::Sender<Response>) {
        let Some(info) = self.mounts.resolve(path) else {
            let _ = reply.send(Response::absent()).await;
            return;
        };
        let request = Request::Query {
            mpath: info.path.clone(),
            get: GetRequest {
                path: path.to_string(),
                reply,
            },
        };
        if let Err(rejected) = self.request_tx.send(request).await {
            // runner already stopped: answer absent so the caller never
            // waits on a reply that cannot come
            if let Request::Query { get, .. } = rejected.0 {
                let _ = get.reply.send(Response::absent()).await;
            }
        }
    }

    /// Ask the runner to start tracking a mountpath already registered
    /// with the mounted-filesystem table. Processed asynchronously.
    pub async fn request_add_mountpath(&self, mpath: &str) -> Result<(), TrackerStopped> {
        self.send_event(MountpathEvent::Add(mpath.to_string())).await
    }

    /// Ask the runner to stop tracking a mountpath, discarding whatever
    /// it has cached. Processed asynchronously.
    pub async fn request_remove_mountpath(&self, mpath: &str) -> Result<(), TrackerStopped> {
        self.send_event(MountpathEvent::Remove(mpath.to_string()))
            .await
    }

    /// Accepted for interface completeness; enabling changes routing in
    /// the registry, not the worker set.
    pub async fn request_enable_mountpath(&self, mpath: &str) -> Result<(), TrackerStopped> {
        self.send_event(MountpathEvent::Enable(mpath.to_string()))
            .await
    }

    /// Accepted for interface completeness; disabling changes routing in
    /// the registry, not the worker set.
    pub async fn request_disable_mountpath(&self, mpath: &str) -> Result<(), TrackerStopped> {
        self.send_event(MountpathEvent::Disable(mpath.to_string()))
            .await
    }

    async fn send_event(&self, event: MountpathEvent) -> Result<(), TrackerStopped> {
        self.mpath_tx.send(event).await.map_err(|_| TrackerStopped)
    }

    /// Request shutdown. The runner stops every worker and returns without
    /// flushing: at most one flush interval of access times is lost, which
    /// LRU tolerates, while waiting on disk writes here would not be.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Counters summed over all mountpaths.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Long-running dispatcher: owns the per-mountpath workers, routes every
/// request by mountpath, and drives the periodic flush tick.
pub struct AtimeRunner {
    request_rx: mpsc::Receiver<Request>,
    mpath_rx: mpsc::Receiver<MountpathEvent>,
    stop_rx: mpsc::Receiver<()>,
    workers: HashMap<String, WorkerHandle>,
    mounts: Arc<MountedFs>,
    oracle: Arc<dyn UtilizationOracle>,
    config: AtimeConfig,
    metrics: Arc<AtimeMetrics>,
}

impl AtimeRunner {
    /// Build the runner and its client handle. Spawn [`run`](Self::run) on
    /// the runtime and hand clones of the tracker to the data path.
    pub fn new(
        mounts: Arc<MountedFs>,
        oracle: Arc<dyn UtilizationOracle>,
        config: AtimeConfig,
    ) -> (AtimeTracker, AtimeRunner) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (mpath_tx, mpath_rx) = mpsc::channel(MPATH_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let metrics = Arc::new(AtimeMetrics::default());
        let tracker = AtimeTracker {
            request_tx,
            mpath_tx,
            stop_tx,
            mounts: Arc::clone(&mounts),
            metrics: Arc::clone(&metrics),
        };
        let runner = AtimeRunner {
            request_rx,
            mpath_rx,
            stop_rx,
            workers: HashMap::new(),
            mounts,
            oracle,
            config,
            metrics,
        };
        (tracker, runner)
    }

    /// Service requests, mountpath changes, and flush ticks until stopped.
    pub async fn run(mut self) {
        info!(flush_period = ?self.config.flush_period, "atime runner starting");
        self.init();
        let period = self.config.flush_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_all(),
                Some(event) = self.mpath_rx.recv() => self.handle_mountpath_event(event),
                request = self.request_rx.recv() => match request {
                    Some(request) => self.dispatch(request).await,
                    None => {
                        debug!("all tracker handles dropped, atime runner exiting");
                        self.shutdown();
                        return;
                    }
                },
                _ = self.stop_rx.recv() => {
                    info!("atime runner stopping");
                    self.shutdown();
                    return;
                }
            }
        }
    }

    /// Start a worker for every mountpath known at startup, disabled ones
    /// included: their cached atimes must be ready when they re-enable.
    fn init(&mut self) {
        let (available, disabled) = self.mounts.enumerate();
        for info in available.iter().chain(disabled.iter()) {
            self.add_worker(info);
        }
    }

    fn shutdown(&mut self) {
        // cached atimes are intentionally discarded, see AtimeTracker::stop
        for (_, worker) in self.workers.drain() {
            worker.stop();
        }
    }

    fn flush_all(&self) {
        for (mpath, worker) in &self.workers {
            // zero asks the worker to size the batch from the policy
            if !worker.try_flush(0) {
                debug!(mpath = %mpath, "previous flush still running, skipping tick");
            }
        }
    }

    fn handle_mountpath_event(&mut self, event: MountpathEvent) {
        match event {
            MountpathEvent::Add(mpath) => match self.mounts.lookup(&mpath) {
                Some(info) => self.add_worker(&info),
                None => {
                    error!(mpath = %mpath, "cannot track mountpath with no registered filesystem")
                }
            },
            MountpathEvent::Remove(mpath) => match self.workers.remove(&mpath) {
                Some(worker) => worker.stop(),
                None => error!(mpath = %mpath, "attempt to remove unknown mountpath"),
            },
            // routing for enable/disable is the registry's concern; the
            // worker and its cached atimes stay put
            MountpathEvent::Enable(_) | MountpathEvent::Disable(_) => {}
        }
    }

    fn add_worker(&mut self, info: &MountpathInfo) {
        if self.workers.contains_key(&info.path) {
            warn!(mpath = %info.path, "attempt to add already tracked mountpath");
            return;
        }
        let (handle, worker) = MpathWorker::new(
            info,
            &self.config,
            Arc::clone(&self.oracle),
            Arc::clone(&self.metrics),
        );
        tokio::spawn(worker.run());
        self.workers.insert(info.path.clone(), handle);
    }

    async fn dispatch(&mut self, request: Request) {
        match request {
            Request::Touch { mpath, set } => {
                if let Some(worker) = self.workers.get(&mpath) {
                    worker.set(set).await;
                }
                // no worker for the mountpath: the touch is dropped
            }
            Request::Query { mpath, get } => match self.workers.get(&mpath) {
                Some(worker) => worker.get(get).await,
                None => {
                    let _ = get.reply.send(Response::absent()).await;
                }
            },
        }
    }
}
