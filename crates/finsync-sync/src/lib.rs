//! Scheduling, worker pool, per-user job chain, reconciliation and duplicate
//! detection.

use std::sync::Arc;

use finsync_core::Cancelled;
use finsync_provider::{ProviderClient, ProviderError};
use finsync_storage::{AccountRepository, BillRepository, StoreError, TransactionRepository};
use thiserror::Error;

mod config;
mod duplicates;
mod jobs;
mod metrics;
mod notify;
mod pool;
mod reconcile;
mod scheduler;

pub use config::{FinsyncConfig, ReconcileConfig};
pub use duplicates::{find_duplicate_groups, DuplicateConfig, DuplicateDetector, DuplicateGroup};
pub use jobs::{
    AccountSyncJob, BillSyncJob, BoxedJob, Job, JobError, JobProvider, TransactionSyncJob,
    UserSyncJob, UserSyncJobProvider,
};
pub use metrics::{JobLabels, JobOutcome, OutcomeLabels, PoolMetrics};
pub use notify::{LogNotifier, NoopNotifier, NotificationMessages, SyncNotifier};
pub use pool::{PoolConfig, PoolError, ShutdownOutcome, WorkerPool};
pub use reconcile::{
    AccountCache, AccountMatch, AccountSyncService, BillSyncService, MatchSource,
    TransactionSyncService,
};
pub use scheduler::{next_scheduled_after, Scheduler, SchedulerConfig, SchedulerError, SchedulerState};

pub const CRATE_NAME: &str = "finsync-sync";

/// Failure of one sync step as a whole. Per-record problems never surface
/// here; they land in [`finsync_core::SyncResult::errors`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync cancelled")]
    Cancelled,
}

impl From<Cancelled> for SyncError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl SyncError {
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, Self::Provider(err) if err.is_invalid_credential())
    }
}

/// The three reconciliation services wired against one provider and one
/// store.
#[derive(Clone)]
pub struct SyncServices {
    pub accounts: Arc<AccountSyncService>,
    pub transactions: Arc<TransactionSyncService>,
    pub bills: Arc<BillSyncService>,
}

impl SyncServices {
    pub fn new<S>(provider: Arc<dyn ProviderClient>, store: Arc<S>, config: &ReconcileConfig) -> Self
    where
        S: AccountRepository + TransactionRepository + BillRepository + 'static,
    {
        let accounts: Arc<dyn AccountRepository> = store.clone();
        let transactions: Arc<dyn TransactionRepository> = store.clone();
        let bills: Arc<dyn BillRepository> = store;
        Self {
            accounts: Arc::new(AccountSyncService::new(provider.clone(), accounts.clone())),
            transactions: Arc::new(TransactionSyncService::new(
                provider.clone(),
                accounts.clone(),
                transactions.clone(),
                config.transaction_lookback_days,
            )),
            bills: Arc::new(BillSyncService::new(
                provider,
                accounts,
                transactions,
                bills,
                config.payment_window_days,
            )),
        }
    }
}
