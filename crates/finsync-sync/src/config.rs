use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::duplicates::DuplicateConfig;
use crate::pool::PoolConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// Transactions older than this many days are not requested.
    pub transaction_lookback_days: i64,
    /// Half-width of the due-date window used to find a bill's payment.
    pub payment_window_days: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            transaction_lookback_days: 90,
            payment_window_days: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinsyncConfig {
    pub scheduler: SchedulerConfig,
    pub pool: PoolConfig,
    pub reconcile: ReconcileConfig,
    pub duplicates: DuplicateConfig,
    pub state_path: PathBuf,
    pub users_path: PathBuf,
    pub messages_path: Option<PathBuf>,
}

impl Default for FinsyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl FinsyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any key/value source; unset or unparsable
    /// values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(name).map(|v| v.trim().to_string());
        let num = |name: &str, default: u64| parse_or(parse(name), default);
        let days = |name: &str, default: i64| parse_or(parse(name), default);

        let pool_defaults = PoolConfig::default();
        let scheduler_defaults = SchedulerConfig::default();

        let schedule_times = match parse("SYNC_SCHEDULE_TIMES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => scheduler_defaults.schedule_times,
        };

        Self {
            scheduler: SchedulerConfig {
                schedule_times,
                run_on_startup: parse("SYNC_RUN_ON_STARTUP")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(scheduler_defaults.run_on_startup),
                tick_interval: scheduler_defaults.tick_interval,
                provider_timeout: Duration::from_secs(num(
                    "SYNC_PROVIDER_TIMEOUT_SECS",
                    scheduler_defaults.provider_timeout.as_secs(),
                )),
                pool_shutdown_timeout: Duration::from_secs(num(
                    "SYNC_SHUTDOWN_TIMEOUT_SECS",
                    scheduler_defaults.pool_shutdown_timeout.as_secs(),
                )),
            },
            pool: PoolConfig {
                worker_count: parse_or(parse("SYNC_WORKERS"), pool_defaults.worker_count).max(1),
                queue_capacity: parse_or(parse("SYNC_QUEUE_CAPACITY"), pool_defaults.queue_capacity)
                    .max(1),
                inter_job_delay: Duration::from_millis(num(
                    "SYNC_INTER_JOB_DELAY_MS",
                    pool_defaults.inter_job_delay.as_millis() as u64,
                )),
                job_timeout: Duration::from_secs(num(
                    "SYNC_JOB_TIMEOUT_SECS",
                    pool_defaults.job_timeout.as_secs(),
                )),
            },
            reconcile: ReconcileConfig {
                transaction_lookback_days: days("SYNC_TRANSACTION_LOOKBACK_DAYS", 90),
                payment_window_days: days("BILL_PAYMENT_WINDOW_DAYS", 5),
            },
            duplicates: DuplicateConfig {
                workers: parse_or(parse("DUPLICATE_WORKERS"), DuplicateConfig::default().workers)
                    .max(1),
                date_tolerance_days: days("DUPLICATE_DATE_TOLERANCE_DAYS", 3),
                payment_window_days: days("BILL_PAYMENT_WINDOW_DAYS", 5),
            },
            state_path: parse("FINSYNC_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/state.json")),
            users_path: parse("FINSYNC_USERS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/users.yaml")),
            messages_path: parse("FINSYNC_MESSAGES_PATH").map(PathBuf::from),
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}
