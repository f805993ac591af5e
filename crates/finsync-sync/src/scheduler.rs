use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use finsync_core::{ScheduleError, ScheduleTime, SyncContext};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::jobs::JobProvider;
use crate::pool::{PoolError, ShutdownOutcome, WorkerPool};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// `HH:MM` entries in local time.
    pub schedule_times: Vec<String>,
    pub run_on_startup: bool,
    pub tick_interval: Duration,
    /// Upper bound on one job-provider call.
    pub provider_timeout: Duration,
    pub pool_shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_times: vec!["06:00".to_string(), "18:00".to_string()],
            run_on_startup: false,
            tick_interval: Duration::from_secs(60),
            provider_timeout: Duration::from_secs(300),
            pool_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    InvalidScheduleTime(#[from] ScheduleError),
    #[error("scheduler cannot start from state {0:?}")]
    NotIdle(SchedulerState),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// First configured time strictly after `now`, today or tomorrow.
pub fn next_scheduled_after(times: &[ScheduleTime], now: NaiveDateTime) -> Option<NaiveDateTime> {
    let today = now.date();
    let at = |date: chrono::NaiveDate, t: &ScheduleTime| date.and_hms_opt(t.hour(), t.minute(), 0);

    let later_today = times
        .iter()
        .filter_map(|t| at(today, t))
        .filter(|candidate| *candidate > now)
        .min();
    later_today.or_else(|| {
        let tomorrow = today.succ_opt()?;
        times.iter().filter_map(|t| at(tomorrow, t)).min()
    })
}

struct SchedulerCore {
    times: Vec<ScheduleTime>,
    config: SchedulerConfig,
    pool: Arc<WorkerPool>,
    provider: Arc<dyn JobProvider>,
    token: CancellationToken,
    last_fired: Mutex<Option<String>>,
}

impl SchedulerCore {
    /// True once per matching minute.
    fn claim_minute(&self, now: NaiveDateTime) -> bool {
        if !self.times.iter().any(|t| t.matches(&now)) {
            return false;
        }
        let key = now.format("%Y-%m-%d-%H:%M").to_string();
        let mut last = self.last_fired.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_deref() == Some(key.as_str()) {
            return false;
        }
        *last = Some(key);
        true
    }

    /// Asks the provider for a batch and hands it to the pool. Returns how
    /// many jobs were accepted; provider failures skip the cycle.
    async fn fire(&self, reason: &'static str) -> usize {
        let ctx = SyncContext::from_token(self.token.child_token());
        let timeout = self.config.provider_timeout;
        let listed = ctx
            .run(tokio::time::timeout(timeout, self.provider.jobs(&ctx)))
            .await;
        let jobs = match listed {
            Ok(Ok(Ok(jobs))) => jobs,
            Ok(Ok(Err(err))) => {
                error!(reason, error = %format!("{err:#}"), "job provider failed; skipping cycle");
                return 0;
            }
            Ok(Err(_)) => {
                error!(
                    reason,
                    timeout_secs = timeout.as_secs(),
                    "job provider timed out; skipping cycle"
                );
                ctx.cancel();
                return 0;
            }
            Err(_) => return 0,
        };
        if jobs.is_empty() {
            info!(reason, "no eligible jobs this cycle");
            return 0;
        }
        info!(reason, jobs = jobs.len(), "scheduler fired");
        self.pool.submit_batch(jobs)
    }
}

/// Wall-clock trigger that feeds batches from a [`JobProvider`] into a
/// [`WorkerPool`].
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    state: Mutex<SchedulerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Fails when any schedule time does not parse.
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<WorkerPool>,
        provider: Arc<dyn JobProvider>,
    ) -> Result<Self, SchedulerError> {
        let mut times = config
            .schedule_times
            .iter()
            .map(|raw| raw.trim().parse::<ScheduleTime>())
            .collect::<Result<Vec<_>, _>>()?;
        times.sort();
        times.dedup();
        if times.is_empty() {
            warn!("no schedule times configured; only manual triggers will run");
        }
        Ok(Self {
            core: Arc::new(SchedulerCore {
                times,
                config,
                pool,
                provider,
                token: CancellationToken::new(),
                last_fired: Mutex::new(None),
            }),
            state: Mutex::new(SchedulerState::Idle),
            handle: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SchedulerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn schedule_times(&self) -> &[ScheduleTime] {
        &self.core.times
    }

    /// Starts the pool (if needed) and the minute loop. Must run inside a
    /// tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SchedulerState::Idle {
                return Err(SchedulerError::NotIdle(*state));
            }
            match self.core.pool.start() {
                Ok(()) | Err(PoolError::AlreadyStarted) => {}
                Err(err) => return Err(err.into()),
            }
            *state = SchedulerState::Running;
        }

        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            if core.config.run_on_startup {
                core.fire("startup").await;
            }
            let mut ticker = tokio::time::interval(core.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = core.token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if core.claim_minute(Local::now().naive_local()) {
                    core.fire("schedule").await;
                }
            }
            info!("scheduler loop exited");
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let times: Vec<String> = self.core.times.iter().map(ToString::to_string).collect();
        info!(
            times = %times.join(","),
            run_on_startup = self.core.config.run_on_startup,
            next = ?self.next_scheduled_time(),
            "scheduler started"
        );
        Ok(())
    }

    /// Fires one cycle immediately, outside the clock.
    pub async fn trigger_now(&self) -> usize {
        self.core.fire("manual").await
    }

    pub fn next_scheduled_time(&self) -> Option<NaiveDateTime> {
        next_scheduled_after(&self.core.times, Local::now().naive_local())
    }

    /// Stops the loop (waiting at most `timeout` for it), then drains the pool
    /// under the pool shutdown timeout.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.set_state(SchedulerState::ShuttingDown);
        self.core.token.cancel();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "scheduler loop ended abnormally"),
                Err(_) => {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "scheduler loop did not stop in time; continuing shutdown"
                    );
                    handle.abort();
                }
            }
        }

        let outcome = self
            .core
            .pool
            .shutdown_with_timeout(self.core.config.pool_shutdown_timeout)
            .await;
        self.set_state(SchedulerState::Stopped);
        info!(?outcome, "scheduler stopped");
        outcome
    }
}
