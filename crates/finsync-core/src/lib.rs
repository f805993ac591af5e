//! Core domain model, merge rules, and cancellation context for finsync.

mod context;
mod merge;
mod model;
mod results;
mod schedule;

pub use context::{Cancelled, SyncContext};
pub use merge::{
    apply_user_edit, merge_account, merge_bill, merge_transaction, new_account, new_bill,
    new_transaction, UserEdit,
};
pub use model::{
    Account, AccountKey, AccountUpsert, Bill, BillMatchCriteria, BillUpsert, ProviderAccount,
    ProviderBill, ProviderTransaction, Transaction, TransactionType, TransactionUpsert,
    UpsertOutcome, UserCredential,
};
pub use results::{cap_errors, DuplicateCheckResult, SyncKind, SyncResult, MAX_REPORTED_ERRORS};
pub use schedule::{ScheduleError, ScheduleTime};

pub const CRATE_NAME: &str = "finsync-core";

/// Lowercases, maps every non-alphanumeric character to a separator and
/// collapses runs of whitespace, so `"PIX  - Maria*Silva"` and
/// `"pix maria silva"` compare equal.
pub fn normalize_description(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
