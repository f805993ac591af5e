//! Provider → local reconciliation for accounts, transactions and bills.

use std::collections::HashMap;

use finsync_core::{Account, AccountKey};
use finsync_storage::{AccountRepository, StoreError};
use uuid::Uuid;

mod accounts;
mod bills;
mod transactions;

pub use accounts::AccountSyncService;
pub use bills::BillSyncService;
pub use transactions::TransactionSyncService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    ExternalId,
    CachedKey,
    Repository,
}

impl MatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalId => "external_id",
            Self::CachedKey => "name_type_subtype",
            Self::Repository => "repository",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountMatch {
    pub account_id: Uuid,
    pub source: MatchSource,
}

/// The user's accounts indexed two ways, built once per sync pass and
/// dropped with it.
#[derive(Debug, Default)]
pub struct AccountCache {
    by_external_id: HashMap<String, Account>,
    by_key: HashMap<AccountKey, Account>,
}

impl AccountCache {
    /// `accounts` must be ordered oldest first; the oldest row wins a key
    /// collision.
    pub fn new(accounts: Vec<Account>) -> Self {
        let mut cache = Self::default();
        for account in accounts {
            cache.by_key.entry(account.key()).or_insert_with(|| account.clone());
            if let Some(ext) = account.external_id.clone() {
                cache.by_external_id.entry(ext).or_insert(account);
            }
        }
        cache
    }

    pub fn len(&self) -> usize {
        self.by_key.len().max(self.by_external_id.len())
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.by_external_id.is_empty()
    }

    pub fn by_external_id(&self, external_id: &str) -> Option<&Account> {
        self.by_external_id.get(external_id)
    }

    pub fn by_key(&self, key: &AccountKey) -> Option<&Account> {
        self.by_key.get(key)
    }

    /// External id, then cached `(name, type, subtype)`, then the repository.
    /// `accept` vets the two key-based candidates; an external id match is
    /// always taken.
    pub async fn resolve<F>(
        &self,
        repo: &dyn AccountRepository,
        user_id: &str,
        external_id: Option<&str>,
        key: Option<&AccountKey>,
        accept: F,
    ) -> Result<Option<AccountMatch>, StoreError>
    where
        F: Fn(&Account) -> bool + Send + Sync,
    {
        if let Some(account) = external_id.and_then(|ext| self.by_external_id(ext)) {
            return Ok(Some(AccountMatch {
                account_id: account.id,
                source: MatchSource::ExternalId,
            }));
        }
        let Some(key) = key else {
            return Ok(None);
        };
        if let Some(account) = self.by_key(key).filter(|a| accept(a)) {
            return Ok(Some(AccountMatch {
                account_id: account.id,
                source: MatchSource::CachedKey,
            }));
        }
        Ok(repo
            .find_by_name_type_subtype(user_id, key)
            .await?
            .filter(|a| accept(a))
            .map(|account| AccountMatch {
                account_id: account.id,
                source: MatchSource::Repository,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use finsync_storage::MemoryStore;
    use rust_decimal_macros::dec;

    fn account(external_id: Option<&str>, name: &str) -> Account {
        let now = Utc::now();
        Account {
            id: Uuid::new_v4(),
            user_id: "user-1".into(),
            external_id: external_id.map(str::to_string),
            item_id: None,
            name: name.into(),
            account_type: "CREDIT".into(),
            subtype: "CREDIT_CARD".into(),
            balance: dec!(0),
            currency_code: "BRL".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn fallback_chain_prefers_external_id_then_cached_key() {
        let known = account(Some("prov-1"), "Nubank");
        let cache = AccountCache::new(vec![known.clone()]);
        let store = MemoryStore::new();
        let key = AccountKey::new("Nubank", "CREDIT", "CREDIT_CARD");

        let by_id = cache
            .resolve(&store, "user-1", Some("prov-1"), None, |_| true)
            .await
            .expect("resolve")
            .expect("match");
        assert_eq!(by_id.source, MatchSource::ExternalId);

        let by_key = cache
            .resolve(&store, "user-1", Some("prov-9"), Some(&key), |_| true)
            .await
            .expect("resolve")
            .expect("match");
        assert_eq!(by_key, AccountMatch { account_id: known.id, source: MatchSource::CachedKey });

        let rejected = cache
            .resolve(&store, "user-1", Some("prov-9"), Some(&key), |_| false)
            .await
            .expect("resolve");
        assert!(rejected.is_none());
    }

    #[tokio::test]
    async fn repository_is_consulted_when_cache_misses() {
        let store = MemoryStore::new();
        let stored = account(None, "Itau");
        store.insert_account(stored.clone()).await;

        let cache = AccountCache::new(Vec::new());
        assert!(cache.is_empty());
        let found = cache
            .resolve(
                &store,
                "user-1",
                None,
                Some(&AccountKey::new("Itau", "CREDIT", "CREDIT_CARD")),
                |_| true,
            )
            .await
            .expect("resolve")
            .expect("match");
        assert_eq!(found.account_id, stored.id);
        assert_eq!(found.source, MatchSource::Repository);
    }
}
