use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use finsync_core::{AccountKey, SyncContext, SyncKind, SyncResult, TransactionUpsert, UserCredential};
use finsync_provider::ProviderClient;
use finsync_storage::{AccountRepository, TransactionRepository};
use tracing::{info, warn};
use uuid::Uuid;

use super::AccountCache;
use crate::SyncError;

pub struct TransactionSyncService {
    provider: Arc<dyn ProviderClient>,
    accounts: Arc<dyn AccountRepository>,
    transactions: Arc<dyn TransactionRepository>,
    lookback_days: i64,
}

impl TransactionSyncService {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        accounts: Arc<dyn AccountRepository>,
        transactions: Arc<dyn TransactionRepository>,
        lookback_days: i64,
    ) -> Self {
        Self {
            provider,
            accounts,
            transactions,
            lookback_days,
        }
    }

    pub async fn sync(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<SyncResult, SyncError> {
        let user_id = credential.user_id.as_str();
        let mut result = SyncResult::new(user_id, SyncKind::Transaction);
        let since = Utc::now().date_naive() - Duration::days(self.lookback_days.max(0));

        let provider_accounts = self.provider.fetch_accounts(ctx, credential).await?;
        let incoming = self
            .provider
            .fetch_transactions(ctx, credential, Some(since))
            .await?;
        result.items_found = incoming.len();

        ctx.ensure_active()?;
        let cache = AccountCache::new(self.accounts.list_by_user(user_id).await?);
        let keys: HashMap<&str, AccountKey> = provider_accounts
            .iter()
            .map(|a| (a.id.as_str(), a.key()))
            .collect();
        let mut resolved: HashMap<&str, Option<Uuid>> = HashMap::new();

        let mut batch = Vec::with_capacity(incoming.len());
        for tx in &incoming {
            ctx.ensure_active()?;
            if tx.id.trim().is_empty() {
                result.push_error(format!(
                    "transaction {:?} on account {} has an empty provider id",
                    tx.description, tx.account_id
                ));
                continue;
            }

            let account_id = match resolved.get(tx.account_id.as_str()) {
                Some(hit) => *hit,
                None => {
                    let lookup = cache
                        .resolve(
                            self.accounts.as_ref(),
                            user_id,
                            Some(&tx.account_id),
                            keys.get(tx.account_id.as_str()),
                            |_| true,
                        )
                        .await;
                    match lookup {
                        Ok(found) => {
                            let id = found.map(|m| m.account_id);
                            resolved.insert(tx.account_id.as_str(), id);
                            id
                        }
                        Err(err) => {
                            result.push_error(format!("transaction {}: {err}", tx.id));
                            continue;
                        }
                    }
                }
            };

            let Some(account_id) = account_id else {
                warn!(
                    user_id,
                    transaction_id = %tx.id,
                    provider_account_id = %tx.account_id,
                    "no local account for transaction; skipping"
                );
                result.skip();
                continue;
            };
            batch.push(TransactionUpsert::from_provider(user_id, account_id, tx));
        }

        let external_ids: Vec<String> = batch.iter().map(|p| p.external_id.clone()).collect();
        let outcomes = ctx.run(self.transactions.upsert_batch(batch)).await?;
        for (external_id, outcome) in external_ids.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => result.record(outcome),
                Err(err) => result.push_error(format!("transaction {external_id}: {err}")),
            }
        }

        info!(
            user_id,
            since = %since,
            found = result.items_found,
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            errors = result.errors.len(),
            "transaction sync finished"
        );
        Ok(result)
    }
}
