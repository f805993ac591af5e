mod logging;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finsync_core::{SyncContext, SyncResult};
use finsync_provider::{HttpProviderClient, HttpProviderConfig, ProviderClient, StaticProviderClient};
use finsync_storage::{MemoryStore, MemoryUserDirectory, SnapshotFile, UserDirectory};
use finsync_sync::{
    DuplicateDetector, FinsyncConfig, JobProvider, LogNotifier, NotificationMessages, PoolMetrics,
    Scheduler, ShutdownOutcome, SyncNotifier, SyncServices, UserSyncJobProvider, WorkerPool,
};
use prometheus_client::registry::Registry;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "finsync")]
#[command(about = "Scheduled Open Finance account, transaction and bill sync")]
struct Cli {
    /// Serve provider data from `<DIR>/<user_id>.json` instead of the HTTP API.
    #[arg(long, global = true, value_name = "DIR")]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C.
    Run,
    /// Sync the given users once (every user with a credential when omitted).
    Sync {
        #[arg(long = "user", value_name = "ID")]
        users: Vec<String>,
    },
    /// Scan stored transactions and bill payments for duplicates.
    CheckDuplicates {
        /// `all` or a comma-separated list of user ids.
        #[arg(long, default_value = "all")]
        users: String,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Sync once and print the metrics registry.
    Metrics {
        #[arg(long = "user", value_name = "ID")]
        users: Vec<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Sync { .. } => "sync",
            Self::CheckDuplicates { .. } => "check-duplicates",
            Self::Metrics { .. } => "metrics",
        }
    }
}

/// Forwards to the log notifier and keeps each user's results for the final
/// report.
struct ReportingNotifier {
    inner: LogNotifier,
    results: Mutex<BTreeMap<String, Vec<SyncResult>>>,
    cleared: Mutex<Vec<String>>,
}

impl ReportingNotifier {
    fn new(inner: LogNotifier) -> Self {
        Self {
            inner,
            results: Mutex::new(BTreeMap::new()),
            cleared: Mutex::new(Vec::new()),
        }
    }

    fn print_report(&self) {
        let results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        for (user_id, steps) in results.iter() {
            println!("{user_id}:");
            for step in steps {
                println!("  {}", step.summary());
            }
        }
        let cleared = self.cleared.lock().unwrap_or_else(PoisonError::into_inner);
        for user_id in cleared.iter() {
            println!("{user_id}: provider credential rejected and cleared");
        }
    }
}

impl SyncNotifier for ReportingNotifier {
    fn sync_complete(&self, user_id: &str, results: &[SyncResult]) {
        self.inner.sync_complete(user_id, results);
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), results.to_vec());
    }

    fn credential_cleared(&self, user_id: &str) {
        self.inner.credential_cleared(user_id);
        self.cleared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(user_id.to_string());
    }
}

struct App {
    config: FinsyncConfig,
    store: Arc<MemoryStore>,
    snapshot: SnapshotFile,
    directory: Arc<MemoryUserDirectory>,
    notifier: Arc<ReportingNotifier>,
    jobs: Arc<UserSyncJobProvider>,
    registry: Registry,
    metrics: PoolMetrics,
}

impl App {
    async fn build(config: FinsyncConfig, fixtures: Option<PathBuf>) -> Result<Self> {
        let snapshot = SnapshotFile::new(&config.state_path);
        let store = Arc::new(MemoryStore::from_snapshot(snapshot.load().await?));

        let directory = if config.users_path.exists() {
            MemoryUserDirectory::from_yaml_file(&config.users_path)?
        } else {
            warn!(path = %config.users_path.display(), "users registry not found; no users to sync");
            MemoryUserDirectory::new()
        };
        let directory = Arc::new(directory);

        let provider: Arc<dyn ProviderClient> = match fixtures {
            Some(dir) => {
                info!(dir = %dir.display(), "using fixture provider");
                Arc::new(StaticProviderClient::from_dir(&dir)?)
            }
            None => Arc::new(
                HttpProviderClient::new(HttpProviderConfig::from_env())
                    .context("building provider http client")?,
            ),
        };

        let messages = match &config.messages_path {
            Some(path) => NotificationMessages::from_yaml_file(path)?,
            None => NotificationMessages::default(),
        };
        let notifier = Arc::new(ReportingNotifier::new(LogNotifier::new(messages)));

        let services = SyncServices::new(provider, store.clone(), &config.reconcile);
        let jobs = Arc::new(UserSyncJobProvider::new(
            directory.clone(),
            services,
            notifier.clone(),
        ));

        let mut registry = Registry::default();
        let metrics = PoolMetrics::new();
        metrics.register(&mut registry);

        Ok(Self {
            config,
            store,
            snapshot,
            directory,
            notifier,
            jobs,
            registry,
            metrics,
        })
    }

    fn pool(&self) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(self.config.pool, self.metrics.clone()))
    }

    async fn save(&self) -> Result<()> {
        let saved = self.snapshot.save(&self.store.snapshot().await).await?;
        info!(
            path = %self.snapshot.path().display(),
            bytes = saved.byte_size,
            unchanged = saved.unchanged,
            "state saved"
        );
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let pool = self.pool();
        let provider: Arc<dyn JobProvider> = self.jobs.clone();
        let scheduler = Scheduler::new(self.config.scheduler.clone(), pool, provider)?;
        scheduler.start()?;

        shutdown_signal().await;
        info!("shutdown requested");
        let outcome = scheduler
            .shutdown(self.config.scheduler.pool_shutdown_timeout)
            .await;
        info!(?outcome, "scheduler stopped");
        self.save().await
    }

    async fn sync_once(&self, users: &[String]) -> Result<()> {
        let jobs = if users.is_empty() {
            self.jobs.jobs(&SyncContext::new()).await?
        } else {
            self.jobs.jobs_for(users).await?
        };
        if jobs.is_empty() {
            warn!("no users with a provider credential matched");
        }

        let pool = self.pool();
        pool.start()?;
        let total = jobs.len();
        let accepted = pool.submit_batch(jobs);
        info!(total, accepted, "sync jobs submitted");

        let outcome = tokio::select! {
            outcome = pool.shutdown() => outcome,
            // Dropping the drain future drops the worker set, which aborts it.
            _ = shutdown_signal() => {
                warn!("interrupted; abandoning queued and running jobs");
                ShutdownOutcome::Forced
            }
        };
        info!(?outcome, "sync run finished");

        self.notifier.print_report();
        self.save().await
    }

    async fn check_duplicates(
        &self,
        users: &str,
        workers: Option<usize>,
        timeout: Duration,
    ) -> Result<()> {
        let user_ids: Vec<String> = if users.trim().eq_ignore_ascii_case("all") {
            self.directory.all_user_ids().await?
        } else {
            users
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let detector = DuplicateDetector::new(
            self.store.clone(),
            self.store.clone(),
            self.config.duplicates,
        )
        .with_workers(workers.unwrap_or(self.config.duplicates.workers));

        let ctx = SyncContext::new();
        let deadline = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(timeout_secs = timeout.as_secs(), "duplicate check timed out");
                ctx.cancel();
            })
        };
        let results = detector.check_all_users_transactions(&ctx, &user_ids).await;
        deadline.abort();

        let mut sorted: Vec<_> = results.into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (user_id, result) in &sorted {
            println!(
                "{user_id}: checked={} found={} marked={} errors={}",
                result.transactions_checked,
                result.duplicates_found,
                result.duplicates_marked,
                result.errors.len()
            );
            for error in result.errors.iter().take(finsync_core::MAX_REPORTED_ERRORS) {
                println!("  {error}");
            }
        }
        self.save().await
    }

    async fn metrics(&self, users: &[String]) -> Result<()> {
        self.sync_once(users).await?;
        let mut encoded = String::new();
        prometheus_client::encoding::text::encode(&mut encoded, &self.registry)
            .context("encoding metrics")?;
        print!("{encoded}");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; waiting forever");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync { users: Vec::new() });
    logging::init_logging(command.name(), "info");

    let app = App::build(FinsyncConfig::from_env(), cli.fixtures).await?;
    match command {
        Commands::Run => app.run().await,
        Commands::Sync { users } => app.sync_once(&users).await,
        Commands::CheckDuplicates {
            users,
            workers,
            timeout_secs,
        } => {
            app.check_duplicates(&users, workers, Duration::from_secs(timeout_secs))
                .await
        }
        Commands::Metrics { users } => app.metrics(&users).await,
    }
}
