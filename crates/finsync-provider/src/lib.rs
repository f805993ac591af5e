//! Provider client contract + HTTP and fixture-backed implementations.

use async_trait::async_trait;
use chrono::NaiveDate;
use finsync_core::{Cancelled, ProviderAccount, ProviderBill, ProviderTransaction, SyncContext, UserCredential};
use thiserror::Error;

mod fixtures;
mod http;

pub use fixtures::{ProviderFixture, StaticProviderClient};
pub use http::{
    classify_response, classify_transport, HttpProviderClient, HttpProviderConfig, RetryDecision,
    RetryPolicy,
};

pub const CRATE_NAME: &str = "finsync-provider";

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected the credential; retrying cannot help.
    #[error("provider rejected credential for item {item_id}")]
    InvalidCredential { item_id: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed provider payload: {0}")]
    Decode(String),
    #[error("no provider data for user {0}")]
    UnknownUser(String),
    #[error("provider call cancelled")]
    Cancelled,
}

impl From<Cancelled> for ProviderError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl ProviderError {
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, Self::InvalidCredential { .. })
    }
}

/// The three read operations the provider exposes. All are idempotent and
/// keyed by the user's credential.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn fetch_accounts(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<Vec<ProviderAccount>, ProviderError>;

    /// Transactions dated on or after `since` when given.
    async fn fetch_transactions(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
        since: Option<NaiveDate>,
    ) -> Result<Vec<ProviderTransaction>, ProviderError>;

    async fn fetch_bills(
        &self,
        ctx: &SyncContext,
        credential: &UserCredential,
    ) -> Result<Vec<ProviderBill>, ProviderError>;
}
