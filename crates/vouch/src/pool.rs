//! Verifier pool: fixed set of workers behind a blocking `submit`.
//!
//! ```text
//! submit ──► PendingJobs.register ──► work queue ──► worker / bridge (xN)
//!   ▲                                                      │
//!   └──── oneshot ◄── PendingJobs.resolve ◄── collector ◄──┘ result queue
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};

use crate::collector::{ResultSender, run_collector};
use crate::job::{Job, JobId, WorkItem};
use crate::pending::PendingJobs;
use crate::process::{SpawnError, WorkerProcess, WorkerSpawner, run_process_bridge};
use crate::verifier::{Identity, Outcome, VerificationError, Verifier, VerifyRequest};
use crate::worker::{SharedWorkQueue, WorkSender, run_worker_loop, work_queue};

/// Environment variable overriding the worker count.
pub const WORKERS_ENV: &str = "VOUCH_WORKERS";

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub num_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Defaults, overridden by `VOUCH_WORKERS` when set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let config = Self::default();
        match lookup(WORKERS_ENV) {
            None => config,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) => config.with_num_workers(n),
                Err(_) => {
                    tracing::warn!(
                        value = %raw,
                        default = config.num_workers,
                        "Ignoring invalid {WORKERS_ENV}"
                    );
                    config
                }
            },
        }
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("failed to start thread: {0}")]
    Thread(#[source] std::io::Error),
    #[error("worker handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("verifier pool is closed")]
    Closed,
    #[error(transparent)]
    Verification(#[from] VerificationError),
    /// The worker running the job was lost and the pool has since closed.
    #[error("job {0} abandoned: its worker was lost")]
    Abandoned(JobId),
}

/// Counts a worker as live until its thread ends, however it ends.
struct LiveWorker(Arc<AtomicUsize>);

impl LiveWorker {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A fixed pool of verification workers.
///
/// Callers block in [`submit`](Self::submit) until their own job's outcome
/// arrives; any number of threads may submit concurrently.
pub struct VerifierPool {
    /// `None` once closed. Submitters hold the read lock across enqueue so
    /// that every accepted job is queued before the shutdown sentinels.
    work_tx: RwLock<Option<WorkSender>>,
    pending: Arc<PendingJobs>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    collector: Mutex<Option<JoinHandle<()>>>,
    live_workers: Arc<AtomicUsize>,
    num_workers: usize,
}

impl VerifierPool {
    /// Start a pool of worker threads sharing `verifier`.
    pub fn start<V>(config: &PoolConfig, verifier: Arc<V>) -> Result<Self, PoolError>
    where
        V: Verifier + ?Sized,
    {
        config.validate()?;
        tracing::info!(num_workers = config.num_workers, "Starting thread verifier pool");

        Self::launch(config.num_workers, |index, work, results, live| {
            let verifier = Arc::clone(&verifier);
            thread::Builder::new()
                .name(format!("vouch-worker-{index}"))
                .spawn(move || {
                    let _live = live;
                    run_worker_loop(index, verifier, work, results);
                })
                .map_err(PoolError::Thread)
        })
    }

    /// Start a pool of worker subprocesses, one bridge thread each.
    ///
    /// Blocks until every worker has reported ready.
    pub fn spawn(config: &PoolConfig, spawner: &dyn WorkerSpawner) -> Result<Self, PoolError> {
        config.validate()?;
        tracing::info!(num_workers = config.num_workers, "Starting process verifier pool");

        Self::launch(config.num_workers, |index, work, results, live| {
            let process = WorkerProcess::start(index, spawner)?;
            thread::Builder::new()
                .name(format!("vouch-worker-{index}"))
                .spawn(move || {
                    let _live = live;
                    run_process_bridge(process, work, results);
                })
                .map_err(PoolError::Thread)
        })
    }

    fn launch<F>(num_workers: usize, mut spawn_one: F) -> Result<Self, PoolError>
    where
        F: FnMut(usize, SharedWorkQueue, ResultSender, LiveWorker) -> Result<JoinHandle<()>, PoolError>,
    {
        let (work_tx, work) = work_queue();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingJobs::new());

        let collector = {
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("vouch-collector".to_string())
                .spawn(move || run_collector(result_rx, pending))
                .map_err(PoolError::Thread)?
        };

        let pool = Self {
            work_tx: RwLock::new(Some(work_tx)),
            pending,
            workers: Mutex::new(Vec::with_capacity(num_workers)),
            collector: Mutex::new(Some(collector)),
            live_workers: Arc::new(AtomicUsize::new(0)),
            num_workers,
        };

        let spawned = (0..num_workers).try_for_each(|index| {
            let live = LiveWorker::new(&pool.live_workers);
            let handle = spawn_one(index, Arc::clone(&work), result_tx.clone(), live)?;
            pool.lock_workers().push(handle);
            Ok(())
        });
        // Workers hold the only result senders from here on, so the
        // collector exits once the last of them does.
        drop(result_tx);

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start verifier pool");
            pool.close();
            return Err(e);
        }

        tracing::info!(num_workers, "Verifier pool ready");
        Ok(pool)
    }

    /// Verify `request` on some worker and wait for the outcome.
    ///
    /// Blocks the calling thread. Must not be called from inside a Tokio
    /// runtime; use [`submit_async`](Self::submit_async) there.
    pub fn submit(&self, request: VerifyRequest) -> Result<Identity, SubmitError> {
        let (id, rx) = self.dispatch(request)?;
        Self::finish(id, rx.blocking_recv())
    }

    /// Like [`submit`](Self::submit), but awaits the outcome.
    pub async fn submit_async(&self, request: VerifyRequest) -> Result<Identity, SubmitError> {
        let (id, rx) = self.dispatch(request)?;
        Self::finish(id, rx.await)
    }

    fn dispatch(
        &self,
        request: VerifyRequest,
    ) -> Result<(JobId, oneshot::Receiver<Outcome>), SubmitError> {
        if self.live_workers.load(Ordering::Acquire) == 0 {
            return Err(SubmitError::Closed);
        }

        let guard = self.read_work_tx();
        let Some(work_tx) = guard.as_ref() else {
            return Err(SubmitError::Closed);
        };

        let (id, rx) = self.pending.register();
        if work_tx.send(WorkItem::Job(Job { id, request })).is_err() {
            self.pending.abandon(id);
            return Err(SubmitError::Closed);
        }
        tracing::trace!(job_id = %id, "Job queued");
        Ok((id, rx))
    }

    fn finish(
        id: JobId,
        received: Result<Outcome, oneshot::error::RecvError>,
    ) -> Result<Identity, SubmitError> {
        match received {
            Ok(outcome) => outcome.map_err(SubmitError::from),
            Err(_) => Err(SubmitError::Abandoned(id)),
        }
    }

    /// Shut the pool down and wait for every worker and the collector.
    ///
    /// Jobs accepted before the call still complete. Callers whose worker
    /// was lost get [`SubmitError::Abandoned`]. Later calls return at once.
    pub fn close(&self) {
        let Some(work_tx) = self.write_work_tx().take() else {
            return;
        };

        tracing::info!(num_workers = self.num_workers, "Closing verifier pool");
        for _ in 0..self.num_workers {
            if work_tx.send(WorkItem::Shutdown).is_err() {
                break;
            }
        }
        drop(work_tx);

        let workers = std::mem::take(&mut *self.lock_workers());
        for handle in workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "Worker thread panicked");
            }
        }

        if let Some(collector) = self.lock_collector().take()
            && collector.join().is_err()
        {
            tracing::error!("Result collector panicked");
        }

        let abandoned = self.pending.clear();
        if abandoned > 0 {
            tracing::warn!(abandoned, "Abandoned jobs whose worker was lost");
        }
        tracing::info!("Verifier pool closed");
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Jobs submitted and not yet delivered.
    pub fn pending_jobs(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.read_work_tx().is_none()
    }

    fn read_work_tx(&self) -> RwLockReadGuard<'_, Option<WorkSender>> {
        self.work_tx.read().unwrap_or_else(|poisoned| {
            tracing::error!("Work queue sender lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn write_work_tx(&self) -> RwLockWriteGuard<'_, Option<WorkSender>> {
        self.work_tx.write().unwrap_or_else(|poisoned| {
            tracing::error!("Work queue sender lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_collector(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.collector.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for VerifierPool {
    fn drop(&mut self) {
        self.close();
    }
}
