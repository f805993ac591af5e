use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use finsync_core::{ProviderAccount, ProviderBill, ProviderTransaction, SyncContext, UserCredential};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{ProviderClient, ProviderError};

/// Canned provider payloads for one user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderFixture {
    #[serde(default)]
    pub accounts: Vec<ProviderAccount>,
    #[serde(default)]
    pub transactions: Vec<ProviderTransaction>,
    #[serde(default)]
    pub bills: Vec<ProviderBill>,
    /// When set every call answers as if the credential had been revoked.
    #[serde(default)]
    pub invalid_credential: bool,
}

/// Offline provider backed by per-user fixtures.
#[derive(Debug, Default)]
pub struct StaticProviderClient {
    fixtures: RwLock<HashMap<String, ProviderFixture>>,
}

impl StaticProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fixture(&self, user_id: impl Into<String>, fixture: ProviderFixture) {
        self.fixtures.write().await.insert(user_id.into(), fixture);
    }

    /// Loads every `<user_id>.json` file in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut fixtures = HashMap::new();
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("listing fixtures in {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("reading entry in {}", dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(user_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = std::fs::read(&path)
                .with_context(|| format!("reading fixture {}", path.display()))?;
            let fixture: ProviderFixture = serde_json::from_slice(&raw)
                .with_context(|| format!("parsing fixture {}", path.display()))?;
            debug!(user_id, accounts = fixture.accounts.len(), "loaded provider fixture");
            fixtures.insert(user_id.to_string(), fixture);
        }
        Ok(Self {
            fixtures: RwLock::new(fixtures),
        })
    }

    async fn fixture_for(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<ProviderFixture, ProviderError> {
        ctx.ensure_active()?;
        let fixtures = self.fixtures.read().await;
        let fixture = fixtures
            .get(&credential.user_id)
            .ok_or_else(|| ProviderError::UnknownUser(credential.user_id.clone()))?;
        if fixture.invalid_credential {
            return Err(ProviderError::InvalidCredential {
                item_id: credential.item_id.clone(),
            });
        }
        Ok(fixture.clone())
    }
}

#[async_trait]
impl ProviderClient for StaticProviderClient {
    async fn fetch_accounts(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        Ok(self.fixture_for(ctx, credential).await?.accounts)
    }

    async fn fetch_transactions(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
        since: Option<NaiveDate>,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        let mut transactions = self.fixture_for(ctx, credential).await?.transactions;
        if let Some(since) = since {
            transactions.retain(|t| t.date >= since);
        }
        Ok(transactions)
    }

    async fn fetch_bills(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<Vec<ProviderBill>, ProviderError> {
        Ok(self.fixture_for(ctx, credential).await?.bills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FIXTURE: &str = r#"{
        "accounts": [
            {"id": "prov-1", "itemId": "item-1", "name": "Nubank", "type": "CREDIT", "subtype": "CREDIT_CARD", "balance": -120.0}
        ],
        "transactions": [
            {"id": "tx-old", "accountId": "prov-1", "description": "OLD", "amount": -10.0, "date": "2025-01-01", "type": "DEBIT"},
            {"id": "tx-new", "accountId": "prov-1", "description": "NEW", "amount": -20.0, "date": "2026-03-01", "type": "DEBIT"}
        ]
    }"#;

    #[tokio::test]
    async fn from_dir_loads_fixtures_and_filters_by_date() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("alice.json"), FIXTURE).expect("write");
        std::fs::write(dir.path().join("README.txt"), "ignored").expect("write");

        let client = StaticProviderClient::from_dir(dir.path()).expect("load");
        let ctx = SyncContext::new();
        let cred = UserCredential::new("alice", "item-1");

        assert_eq!(client.fetch_accounts(&ctx, &cred).await.expect("accounts").len(), 1);
        let recent = client
            .fetch_transactions(&ctx, &cred, NaiveDate::from_ymd_opt(2026, 1, 1))
            .await
            .expect("transactions");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "tx-new");
        assert!(client.fetch_bills(&ctx, &cred).await.expect("bills").is_empty());
    }

    #[tokio::test]
    async fn revoked_and_unknown_users_fail() {
        let client = StaticProviderClient::new();
        client
            .set_fixture(
                "bob",
                ProviderFixture {
                    invalid_credential: true,
                    ..ProviderFixture::default()
                },
            )
            .await;
        let ctx = SyncContext::new();

        let err = client
            .fetch_accounts(&ctx, &UserCredential::new("bob", "item-2"))
            .await
            .expect_err("revoked");
        assert!(err.is_invalid_credential());

        let err = client
            .fetch_accounts(&ctx, &UserCredential::new("carol", "item-3"))
            .await
            .expect_err("unknown");
        assert!(matches!(err, ProviderError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let client = StaticProviderClient::new();
        client.set_fixture("alice", ProviderFixture::default()).await;
        let ctx = SyncContext::new();
        ctx.cancel();
        let err = client
            .fetch_accounts(&ctx, &UserCredential::new("alice", "item-1"))
            .await
            .expect_err("cancelled");
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
