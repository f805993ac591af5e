use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use finsync_core::{Cancelled, SyncContext, SyncKind, SyncResult, UserCredential};
use finsync_storage::UserDirectory;
use thiserror::Error;
use tracing::{info, warn};

use crate::notify::{NoopNotifier, SyncNotifier};
use crate::reconcile::{AccountSyncService, BillSyncService, TransactionSyncService};
use crate::{SyncError, SyncServices};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{step} sync failed for {owner}: {source}")]
    Step {
        step: SyncKind,
        owner: String,
        #[source]
        source: SyncError,
    },
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),
    #[error("job cancelled")]
    Cancelled,
}

impl From<Cancelled> for JobError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl JobError {
    fn step(step: SyncKind, owner: &str, source: SyncError) -> Self {
        match source {
            SyncError::Cancelled => Self::Cancelled,
            source => Self::Step {
                step,
                owner: owner.to_string(),
                source,
            },
        }
    }

    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, Self::Step { source, .. } if source.is_invalid_credential())
    }
}

/// Unit of work run by the pool.
#[async_trait]
pub trait Job: Send + Sync {
    fn owner_key(&self) -> &str;

    fn description(&self) -> String;

    /// Low-cardinality label for metrics and spans.
    fn kind(&self) -> &'static str;

    async fn execute(&self, ctx: &SyncContext) -> Result<Vec<SyncResult>, JobError>;
}

pub type BoxedJob = Box<dyn Job>;

pub struct AccountSyncJob {
    credential: UserCredential,
    service: Arc<AccountSyncService>,
}

impl AccountSyncJob {
    pub fn new(credential: UserCredential, service: Arc<AccountSyncService>) -> Self {
        Self { credential, service }
    }
}

#[async_trait]
impl Job for AccountSyncJob {
    fn owner_key(&self) -> &str {
        &self.credential.user_id
    }

    fn description(&self) -> String {
        format!("account sync for {}", self.credential.user_id)
    }

    fn kind(&self) -> &'static str {
        "account_sync"
    }

    async fn execute(&self, ctx: &SyncContext) -> Result<Vec<SyncResult>, JobError> {
        self.service
            .sync(ctx, &self.credential)
            .await
            .map(|result| vec![result])
            .map_err(|err| JobError::step(SyncKind::Account, self.owner_key(), err))
    }
}

pub struct TransactionSyncJob {
    credential: UserCredential,
    service: Arc<TransactionSyncService>,
}

impl TransactionSyncJob {
    pub fn new(credential: UserCredential, service: Arc<TransactionSyncService>) -> Self {
        Self { credential, service }
    }
}

#[async_trait]
impl Job for TransactionSyncJob {
    fn owner_key(&self) -> &str {
        &self.credential.user_id
    }

    fn description(&self) -> String {
        format!("transaction sync for {}", self.credential.user_id)
    }

    fn kind(&self) -> &'static str {
        "transaction_sync"
    }

    async fn execute(&self, ctx: &SyncContext) -> Result<Vec<SyncResult>, JobError> {
        self.service
            .sync(ctx, &self.credential)
            .await
            .map(|result| vec![result])
            .map_err(|err| JobError::step(SyncKind::Transaction, self.owner_key(), err))
    }
}

pub struct BillSyncJob {
    credential: UserCredential,
    service: Arc<BillSyncService>,
}

impl BillSyncJob {
    pub fn new(credential: UserCredential, service: Arc<BillSyncService>) -> Self {
        Self { credential, service }
    }
}

#[async_trait]
impl Job for BillSyncJob {
    fn owner_key(&self) -> &str {
        &self.credential.user_id
    }

    fn description(&self) -> String {
        format!("bill sync for {}", self.credential.user_id)
    }

    fn kind(&self) -> &'static str {
        "bill_sync"
    }

    async fn execute(&self, ctx: &SyncContext) -> Result<Vec<SyncResult>, JobError> {
        self.service
            .sync(ctx, &self.credential)
            .await
            .map(|result| vec![result])
            .map_err(|err| JobError::step(SyncKind::Bill, self.owner_key(), err))
    }
}

/// Runs account, transaction and bill sync for one user, in that order,
/// stopping at the first failing step. Transactions resolve against synced
/// accounts and payments against synced transactions, so a later step never
/// runs on a stale predecessor.
pub struct UserSyncJob {
    user_id: String,
    steps: [BoxedJob; 3],
    notifier: Arc<dyn SyncNotifier>,
    directory: Option<Arc<dyn UserDirectory>>,
}

impl UserSyncJob {
    pub fn new(credential: UserCredential, services: &SyncServices) -> Self {
        Self::from_steps(
            credential.user_id.clone(),
            [
                Box::new(AccountSyncJob::new(credential.clone(), services.accounts.clone())),
                Box::new(TransactionSyncJob::new(
                    credential.clone(),
                    services.transactions.clone(),
                )),
                Box::new(BillSyncJob::new(credential, services.bills.clone())),
            ],
        )
    }

    /// Steps run in array order.
    pub fn from_steps(user_id: impl Into<String>, steps: [BoxedJob; 3]) -> Self {
        Self {
            user_id: user_id.into(),
            steps,
            notifier: Arc::new(NoopNotifier),
            directory: None,
        }
    }

    pub fn with_hooks(
        mut self,
        notifier: Arc<dyn SyncNotifier>,
        directory: Option<Arc<dyn UserDirectory>>,
    ) -> Self {
        self.notifier = notifier;
        self.directory = directory;
        self
    }

    async fn clear_credential(&self) {
        if let Some(directory) = &self.directory {
            if let Err(err) = directory.clear_credential(&self.user_id).await {
                warn!(user_id = %self.user_id, error = %err, "failed to clear rejected credential");
                return;
            }
        }
        self.notifier.credential_cleared(&self.user_id);
    }
}

#[async_trait]
impl Job for UserSyncJob {
    fn owner_key(&self) -> &str {
        &self.user_id
    }

    fn description(&self) -> String {
        format!("full sync for {}", self.user_id)
    }

    fn kind(&self) -> &'static str {
        "user_sync"
    }

    async fn execute(&self, ctx: &SyncContext) -> Result<Vec<SyncResult>, JobError> {
        let mut results = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            ctx.ensure_active()?;
            match step.execute(ctx).await {
                Ok(mut step_results) => results.append(&mut step_results),
                Err(err) => {
                    warn!(
                        user_id = %self.user_id,
                        step = step.kind(),
                        error = %err,
                        "user sync chain aborted"
                    );
                    if err.is_invalid_credential() {
                        self.clear_credential().await;
                    }
                    return Err(err);
                }
            }
        }
        for result in &results {
            info!(user_id = %self.user_id, "{}", result.summary());
        }
        self.notifier.sync_complete(&self.user_id, &results);
        Ok(results)
    }
}

/// Supplies the batch for one scheduling cycle.
#[async_trait]
pub trait JobProvider: Send + Sync {
    async fn jobs(&self, ctx: &SyncContext) -> anyhow::Result<Vec<BoxedJob>>;
}

/// One [`UserSyncJob`] per user holding a provider credential.
pub struct UserSyncJobProvider {
    directory: Arc<dyn UserDirectory>,
    services: SyncServices,
    notifier: Arc<dyn SyncNotifier>,
}

impl UserSyncJobProvider {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        services: SyncServices,
        notifier: Arc<dyn SyncNotifier>,
    ) -> Self {
        Self {
            directory,
            services,
            notifier,
        }
    }

    fn build(&self, credential: UserCredential) -> BoxedJob {
        Box::new(
            UserSyncJob::new(credential, &self.services)
                .with_hooks(self.notifier.clone(), Some(self.directory.clone())),
        )
    }

    /// Jobs for the listed users only; users without a credential are left
    /// out.
    pub async fn jobs_for(&self, user_ids: &[String]) -> anyhow::Result<Vec<BoxedJob>> {
        let eligible = self
            .directory
            .users_with_credentials()
            .await
            .context("listing users with provider credentials")?;
        Ok(eligible
            .into_iter()
            .filter(|c| user_ids.iter().any(|id| id == &c.user_id))
            .map(|c| self.build(c))
            .collect())
    }
}

#[async_trait]
impl JobProvider for UserSyncJobProvider {
    async fn jobs(&self, ctx: &SyncContext) -> anyhow::Result<Vec<BoxedJob>> {
        ctx.ensure_active()?;
        let eligible = self
            .directory
            .users_with_credentials()
            .await
            .context("listing users with provider credentials")?;
        info!(users = eligible.len(), "built user sync jobs");
        Ok(eligible.into_iter().map(|c| self.build(c)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsync_provider::ProviderError;
    use finsync_storage::MemoryUserDirectory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingStep {
        kind: SyncKind,
        calls: Arc<AtomicUsize>,
        fail_with: Option<fn() -> SyncError>,
    }

    #[async_trait]
    impl Job for CountingStep {
        fn owner_key(&self) -> &str {
            "alice"
        }
        fn description(&self) -> String {
            format!("{} step", self.kind)
        }
        fn kind(&self) -> &'static str {
            self.kind.as_str()
        }
        async fn execute(&self, _ctx: &SyncContext) -> Result<Vec<SyncResult>, JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(JobError::step(self.kind, "alice", make())),
                None => Ok(vec![SyncResult::new("alice", self.kind)]),
            }
        }
    }

    fn chain(fail_at: Option<(SyncKind, fn() -> SyncError)>) -> (UserSyncJob, [Arc<AtomicUsize>; 3]) {
        let counters = [
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        ];
        let step = |kind: SyncKind, calls: &Arc<AtomicUsize>| -> BoxedJob {
            Box::new(CountingStep {
                kind,
                calls: calls.clone(),
                fail_with: fail_at.filter(|(k, _)| *k == kind).map(|(_, f)| f),
            })
        };
        let job = UserSyncJob::from_steps(
            "alice",
            [
                step(SyncKind::Account, &counters[0]),
                step(SyncKind::Transaction, &counters[1]),
                step(SyncKind::Bill, &counters[2]),
            ],
        );
        (job, counters)
    }

    fn counts(counters: &[Arc<AtomicUsize>; 3]) -> [usize; 3] {
        [0, 1, 2].map(|i| counters[i].load(Ordering::SeqCst))
    }

    fn store_failure() -> SyncError {
        SyncError::Store(finsync_storage::StoreError::Invalid("boom".into()))
    }

    fn rejected_credential() -> SyncError {
        SyncError::Provider(ProviderError::InvalidCredential {
            item_id: "item-1".into(),
        })
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<String>>,
    }

    impl SyncNotifier for RecordingNotifier {
        fn sync_complete(&self, user_id: &str, results: &[SyncResult]) {
            self.events
                .lock()
                .expect("lock")
                .push(format!("complete:{user_id}:{}", results.len()));
        }
        fn credential_cleared(&self, user_id: &str) {
            self.events.lock().expect("lock").push(format!("cleared:{user_id}"));
        }
    }

    #[tokio::test]
    async fn steps_run_in_order_and_all_results_are_returned() {
        let (job, counters) = chain(None);
        let results = job.execute(&SyncContext::new()).await.expect("chain");
        let kinds: Vec<_> = results.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![SyncKind::Account, SyncKind::Transaction, SyncKind::Bill]);
        assert_eq!(counts(&counters), [1, 1, 1]);
    }

    #[tokio::test]
    async fn failing_account_step_stops_the_chain() {
        let (job, counters) = chain(Some((SyncKind::Account, store_failure)));
        let err = job.execute(&SyncContext::new()).await.expect_err("chain fails");
        assert!(matches!(err, JobError::Step { step: SyncKind::Account, .. }));
        assert_eq!(counts(&counters), [1, 0, 0]);
    }

    #[tokio::test]
    async fn failing_transaction_step_skips_bills() {
        let (job, counters) = chain(Some((SyncKind::Transaction, store_failure)));
        assert!(job.execute(&SyncContext::new()).await.is_err());
        assert_eq!(counts(&counters), [1, 1, 0]);
    }

    #[tokio::test]
    async fn rejected_credential_is_cleared_and_notified() {
        let directory = Arc::new(MemoryUserDirectory::from_credentials([UserCredential::new(
            "alice", "item-1",
        )]));
        let notifier = Arc::new(RecordingNotifier::default());
        let (job, counters) = chain(Some((SyncKind::Account, rejected_credential)));
        let job = job.with_hooks(notifier.clone(), Some(directory.clone()));

        let err = job.execute(&SyncContext::new()).await.expect_err("rejected");
        assert!(err.is_invalid_credential());
        assert_eq!(counts(&counters), [1, 0, 0]);
        assert!(directory.users_with_credentials().await.expect("list").is_empty());
        assert_eq!(*notifier.events.lock().expect("lock"), vec!["cleared:alice".to_string()]);
    }

    #[tokio::test]
    async fn success_notifies_once_with_every_step_result() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (job, _) = chain(None);
        let job = job.with_hooks(notifier.clone(), None);
        job.execute(&SyncContext::new()).await.expect("chain");
        assert_eq!(*notifier.events.lock().expect("lock"), vec!["complete:alice:3".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_context_runs_no_steps() {
        let (job, counters) = chain(None);
        let ctx = SyncContext::new();
        ctx.cancel();
        assert!(matches!(job.execute(&ctx).await, Err(JobError::Cancelled)));
        assert_eq!(counts(&counters), [0, 0, 0]);
    }
}
