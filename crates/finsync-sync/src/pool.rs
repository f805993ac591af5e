use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use finsync_core::SyncContext;
use flume::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::jobs::{BoxedJob, Job, JobError};
use crate::metrics::{JobOutcome, PoolMetrics};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Pause each worker takes between two jobs.
    pub inter_job_delay: Duration,
    pub job_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 100,
            inter_job_delay: Duration::from_millis(500),
            job_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool already started")]
    AlreadyStarted,
    #[error("job queue full (capacity {capacity}); dropped job for {owner}")]
    QueueFull { owner: String, capacity: usize },
    #[error("worker pool is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every accepted job ran before the workers exited.
    Drained,
    /// Accepted work did not run to completion: the timeout hit and
    /// in-flight jobs were cancelled, or the pool never started.
    Forced,
}

/// Fixed set of workers draining one bounded queue.
///
/// `submit` never waits: a full queue drops the job. Shutdown closes the
/// queue, lets the workers drain it, then cancels the pool token.
pub struct WorkerPool {
    config: PoolConfig,
    metrics: PoolMetrics,
    sender: Mutex<Option<Sender<BoxedJob>>>,
    receiver: Receiver<BoxedJob>,
    token: CancellationToken,
    workers: Mutex<Option<JoinSet<()>>>,
    started: AtomicBool,
    dropped: AtomicU64,
    running: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, metrics: PoolMetrics) -> Self {
        let (sender, receiver) = flume::bounded(config.queue_capacity.max(1));
        Self {
            config,
            metrics,
            sender: Mutex::new(Some(sender)),
            receiver,
            token: CancellationToken::new(),
            workers: Mutex::new(None),
            started: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.lock_sender().is_none() {
            return Err(PoolError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }

        let mut set = JoinSet::new();
        for worker_id in 0..self.config.worker_count.max(1) {
            set.spawn(run_worker(
                worker_id,
                self.receiver.clone(),
                self.token.clone(),
                self.config,
                self.metrics.clone(),
                RunningGuard::enter(self.running.clone()),
            ));
        }
        *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = Some(set);
        info!(
            workers = self.config.worker_count.max(1),
            queue_capacity = self.config.queue_capacity.max(1),
            "worker pool started"
        );
        Ok(())
    }

    pub fn submit(&self, job: BoxedJob) -> Result<(), PoolError> {
        let guard = self.lock_sender();
        let Some(sender) = guard.as_ref() else {
            return Err(PoolError::Closed);
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.queue_dropped_total.inc();
                let capacity = self.config.queue_capacity.max(1);
                warn!(
                    owner = job.owner_key(),
                    job = %job.description(),
                    capacity,
                    "job queue full; dropping job"
                );
                Err(PoolError::QueueFull {
                    owner: job.owner_key().to_string(),
                    capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Closed),
        }
    }

    /// Returns how many jobs were accepted. A partial batch is not an error.
    pub fn submit_batch(&self, jobs: Vec<BoxedJob>) -> usize {
        let total = jobs.len();
        let submitted = jobs
            .into_iter()
            .map(|job| self.submit(job))
            .filter(Result::is_ok)
            .count();
        if submitted < total {
            warn!(submitted, total, "job batch partially submitted");
        } else {
            info!(submitted, total, "job batch submitted");
        }
        submitted
    }

    pub fn dropped_jobs(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued_jobs(&self) -> usize {
        self.receiver.len()
    }

    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.lock_sender().is_none()
    }

    /// Waits for every accepted job to finish.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        self.stop(None).await
    }

    /// Like [`shutdown`](Self::shutdown) but cancels whatever is still
    /// running once `timeout` elapses.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> ShutdownOutcome {
        self.stop(Some(timeout)).await
    }

    async fn stop(&self, timeout: Option<Duration>) -> ShutdownOutcome {
        drop(self.lock_sender().take());
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let outcome = match (workers, timeout) {
            (None, _) => {
                let abandoned = self.receiver.drain().count();
                if abandoned > 0 {
                    warn!(abandoned, "worker pool never started; discarding queued jobs");
                    ShutdownOutcome::Forced
                } else {
                    ShutdownOutcome::Drained
                }
            }
            (Some(mut set), None) => {
                join_workers(&mut set).await;
                ShutdownOutcome::Drained
            }
            (Some(mut set), Some(limit)) => {
                match tokio::time::timeout(limit, join_workers(&mut set)).await {
                    Ok(()) => ShutdownOutcome::Drained,
                    Err(_) => {
                        warn!(
                            timeout_ms = limit.as_millis() as u64,
                            queued = self.queued_jobs(),
                            "pool drain timed out; cancelling in-flight jobs"
                        );
                        self.token.cancel();
                        join_workers(&mut set).await;
                        ShutdownOutcome::Forced
                    }
                }
            }
        };
        self.token.cancel();
        info!(?outcome, dropped = self.dropped_jobs(), "worker pool stopped");
        outcome
    }

    fn lock_sender(&self) -> std::sync::MutexGuard<'_, Option<Sender<BoxedJob>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn join_workers(set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(error = %err, "worker panicked");
            }
        }
    }
}

/// Counts live workers; decrements even if the worker panics.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Receiver<BoxedJob>,
    token: CancellationToken,
    config: PoolConfig,
    metrics: PoolMetrics,
    _running: RunningGuard,
) {
    debug!(worker_id, "worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = receiver.recv_async() => match received {
                Ok(job) => job,
                // Sender dropped and queue drained.
                Err(_) => break,
            },
        };

        run_job(worker_id, job.as_ref(), &token, &config, &metrics).await;

        if !config.inter_job_delay.is_zero() {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(config.inter_job_delay) => {}
            }
        }
    }
    debug!(worker_id, "worker exited");
}

async fn run_job(
    worker_id: usize,
    job: &dyn Job,
    token: &CancellationToken,
    config: &PoolConfig,
    metrics: &PoolMetrics,
) {
    let ctx = SyncContext::from_token(token.child_token());
    let started = Instant::now();
    let span = info_span!("job", worker_id, kind = job.kind(), owner = job.owner_key());

    let outcome = async {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                warn!("job aborted by pool shutdown");
                JobOutcome::Cancelled
            }
            res = tokio::time::timeout(config.job_timeout, job.execute(&ctx)) => match res {
                Ok(Ok(results)) => {
                    info!(steps = results.len(), "job finished");
                    JobOutcome::Success
                }
                Ok(Err(JobError::Cancelled)) => {
                    warn!("job cancelled");
                    JobOutcome::Cancelled
                }
                Ok(Err(err)) => {
                    error!(error = %err, "job failed");
                    JobOutcome::Error
                }
                Err(_) => {
                    let err = JobError::TimedOut(config.job_timeout);
                    error!(error = %err, "job failed");
                    JobOutcome::Timeout
                }
            },
        }
    }
    .instrument(span)
    .await;

    ctx.cancel();
    metrics.observe_job(job.kind(), outcome, started.elapsed().as_secs_f64());
}
