use std::collections::HashSet;
use std::sync::Arc;

use finsync_core::{AccountUpsert, SyncContext, SyncKind, SyncResult, UserCredential};
use finsync_provider::ProviderClient;
use finsync_storage::AccountRepository;
use tracing::{debug, info};
use uuid::Uuid;

use super::AccountCache;
use crate::SyncError;

/// Pulls the user's accounts from the provider and upserts them.
///
/// A provider account the cache resolves only by `(name, type, subtype)` is
/// treated as the same account under a reissued external id: the matched row
/// is updated and re-pointed, never duplicated. A key match is refused when
/// the matched row still carries an external id the provider returned in the
/// same batch, or when another provider account already claimed it.
pub struct AccountSyncService {
    provider: Arc<dyn ProviderClient>,
    accounts: Arc<dyn AccountRepository>,
}

impl AccountSyncService {
    pub fn new(provider: Arc<dyn ProviderClient>, accounts: Arc<dyn AccountRepository>) -> Self {
        Self { provider, accounts }
    }

    pub async fn sync(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<SyncResult, SyncError> {
        let user_id = credential.user_id.as_str();
        let mut result = SyncResult::new(user_id, SyncKind::Account);

        let incoming = self.provider.fetch_accounts(ctx, credential).await?;
        result.items_found = incoming.len();

        ctx.ensure_active()?;
        let cache = AccountCache::new(self.accounts.list_by_user(user_id).await?);
        let incoming_ids: HashSet<&str> = incoming.iter().map(|a| a.id.as_str()).collect();
        let mut claimed: HashSet<Uuid> = HashSet::new();

        for account in &incoming {
            ctx.ensure_active()?;
            if account.id.trim().is_empty() {
                result.push_error(format!("account {:?} has an empty provider id", account.name));
                continue;
            }

            let key = account.key();
            let resolved = cache
                .resolve(
                    self.accounts.as_ref(),
                    user_id,
                    Some(&account.id),
                    Some(&key),
                    |candidate| {
                        !claimed.contains(&candidate.id)
                            && candidate
                                .external_id
                                .as_deref()
                                .map_or(true, |ext| !incoming_ids.contains(ext))
                    },
                )
                .await;
            let existing = match resolved {
                Ok(found) => found,
                Err(err) => {
                    result.push_error(format!("account {}: {err}", account.id));
                    continue;
                }
            };
            if let Some(found) = existing {
                debug!(
                    user_id,
                    external_id = %account.id,
                    account_id = %found.account_id,
                    matched_by = found.source.as_str(),
                    "matched provider account"
                );
                claimed.insert(found.account_id);
            }

            let params = AccountUpsert::from_provider(
                user_id,
                account,
                existing.map(|found| found.account_id),
            );
            match self.accounts.upsert(params).await {
                Ok(outcome) => {
                    claimed.insert(outcome.id());
                    result.record(outcome);
                }
                Err(err) => result.push_error(format!("account {}: {err}", account.id)),
            }
        }

        info!(
            user_id,
            found = result.items_found,
            created = result.created,
            updated = result.updated,
            errors = result.errors.len(),
            "account sync finished"
        );
        Ok(result)
    }
}
