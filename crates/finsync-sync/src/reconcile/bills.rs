use std::collections::HashMap;
use std::sync::Arc;

use finsync_core::{
    AccountKey, BillMatchCriteria, BillUpsert, SyncContext, SyncKind, SyncResult, UserCredential,
};
use finsync_provider::ProviderClient;
use finsync_storage::{AccountRepository, BillRepository, StoreError, TransactionRepository};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AccountCache;
use crate::SyncError;

pub struct BillSyncService {
    provider: Arc<dyn ProviderClient>,
    accounts: Arc<dyn AccountRepository>,
    transactions: Arc<dyn TransactionRepository>,
    bills: Arc<dyn BillRepository>,
    payment_window_days: i64,
}

impl BillSyncService {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        accounts: Arc<dyn AccountRepository>,
        transactions: Arc<dyn TransactionRepository>,
        bills: Arc<dyn BillRepository>,
        payment_window_days: i64,
    ) -> Self {
        Self {
            provider,
            accounts,
            transactions,
            bills,
            payment_window_days,
        }
    }

    pub async fn sync(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<SyncResult, SyncError> {
        let user_id = credential.user_id.as_str();
        let mut result = SyncResult::new(user_id, SyncKind::Bill);

        let provider_accounts = self.provider.fetch_accounts(ctx, credential).await?;
        let incoming = self.provider.fetch_bills(ctx, credential).await?;
        result.items_found = incoming.len();

        ctx.ensure_active()?;
        let cache = AccountCache::new(self.accounts.list_by_user(user_id).await?);
        let keys: HashMap<&str, AccountKey> = provider_accounts
            .iter()
            .map(|a| (a.id.as_str(), a.key()))
            .collect();

        let mut synced: Vec<Uuid> = Vec::new();
        for bill in &incoming {
            ctx.ensure_active()?;
            if bill.id.trim().is_empty() {
                result.push_error(format!(
                    "bill due {} on account {} has an empty provider id",
                    bill.due_date, bill.account_id
                ));
                continue;
            }

            let lookup = cache
                .resolve(
                    self.accounts.as_ref(),
                    user_id,
                    Some(&bill.account_id),
                    keys.get(bill.account_id.as_str()),
                    |_| true,
                )
                .await;
            let account_id = match lookup {
                Ok(Some(found)) => found.account_id,
                Ok(None) => {
                    warn!(
                        user_id,
                        bill_id = %bill.id,
                        provider_account_id = %bill.account_id,
                        due_date = %bill.due_date,
                        "no local account for bill; skipping"
                    );
                    result.skip();
                    continue;
                }
                Err(err) => {
                    result.push_error(format!("bill {}: {err}", bill.id));
                    continue;
                }
            };

            match self
                .bills
                .upsert(BillUpsert::from_provider(user_id, account_id, bill))
                .await
            {
                Ok(outcome) => {
                    result.record(outcome);
                    synced.push(outcome.id());
                }
                Err(err) => result.push_error(format!("bill {}: {err}", bill.id)),
            }
        }

        let mut paid = 0usize;
        for bill_id in synced {
            ctx.ensure_active()?;
            match self.link_payment(user_id, bill_id).await {
                Ok(true) => paid += 1,
                Ok(false) => {}
                Err(err) => result.push_error(format!("bill {bill_id} payment lookup: {err}")),
            }
        }

        info!(
            user_id,
            found = result.items_found,
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            paid,
            errors = result.errors.len(),
            "bill sync finished"
        );
        Ok(result)
    }

    /// Records the first matching payment on an unpaid bill. Returns whether
    /// a link was written.
    async fn link_payment(&self, user_id: &str, bill_id: Uuid) -> Result<bool, StoreError> {
        let Some(bill) = self.bills.get_by_id(bill_id).await? else {
            return Ok(false);
        };
        if bill.is_paid() {
            return Ok(false);
        }
        let criteria = BillMatchCriteria::around(
            bill.account_id,
            bill.total_amount,
            bill.due_date,
            self.payment_window_days,
        );
        let candidates = self
            .transactions
            .find_payment_candidates(user_id, &criteria)
            .await?;
        let Some(payment) = candidates.first() else {
            return Ok(false);
        };
        debug!(
            user_id,
            bill_id = %bill.id,
            transaction_id = %payment.id,
            "bill matched payment transaction"
        );
        self.bills.set_payment_transaction(bill.id, payment.id).await
    }
}
