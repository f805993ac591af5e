//! Repository contracts plus an in-memory implementation with JSON snapshots.

use async_trait::async_trait;
use finsync_core::{
    Account, AccountKey, AccountUpsert, Bill, BillMatchCriteria, BillUpsert, Transaction,
    TransactionUpsert, UpsertOutcome, UserCredential,
};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod snapshot;
mod users;

pub use memory::MemoryStore;
pub use snapshot::{SavedSnapshot, SnapshotFile, StoreSnapshot};
pub use users::MemoryUserDirectory;

pub const CRATE_NAME: &str = "finsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Account>, StoreError>;

    /// Oldest account of `user_id` whose name, type and subtype equal `key`.
    async fn find_by_name_type_subtype(
        &self,
        user_id: &str,
        key: &AccountKey,
    ) -> Result<Option<Account>, StoreError>;

    async fn upsert(&self, params: AccountUpsert) -> Result<UpsertOutcome, StoreError>;
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Transaction>, StoreError>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Transaction>, StoreError>;

    /// Inserts on first sight of `(user_id, external_id)`, otherwise applies
    /// [`finsync_core::merge_transaction`]. Unchanged rows are not written.
    async fn upsert(&self, params: TransactionUpsert) -> Result<UpsertOutcome, StoreError>;

    /// One outcome per input, in input order. A failing row does not stop the
    /// rest of the batch.
    async fn upsert_batch(
        &self,
        params: Vec<TransactionUpsert>,
    ) -> Vec<Result<UpsertOutcome, StoreError>> {
        let mut outcomes = Vec::with_capacity(params.len());
        for item in params {
            outcomes.push(self.upsert(item).await);
        }
        outcomes
    }

    /// Non-duplicate transactions on `criteria.account_id` dated inside the
    /// window whose absolute amount equals `criteria.amount`, oldest first.
    async fn find_payment_candidates(
        &self,
        user_id: &str,
        criteria: &BillMatchCriteria,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Returns `false` when the row was already marked against `canonical_id`.
    async fn mark_duplicate(&self, id: Uuid, canonical_id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait BillRepository: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Bill>, StoreError>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Bill>, StoreError>;

    async fn upsert(&self, params: BillUpsert) -> Result<UpsertOutcome, StoreError>;

    /// Bill on `criteria.account_id` due inside the window whose total equals
    /// the absolute criteria amount.
    async fn find_matching_bill(
        &self,
        user_id: &str,
        criteria: &BillMatchCriteria,
    ) -> Result<Option<Bill>, StoreError>;

    async fn set_payment_transaction(
        &self,
        bill_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, StoreError>;
}

/// Source of the users eligible for scheduled sync.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn users_with_credentials(&self) -> Result<Vec<UserCredential>, StoreError>;

    async fn all_user_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Drops the stored provider credential. Returns `false` if there was none.
    async fn clear_credential(&self, user_id: &str) -> Result<bool, StoreError>;
}
