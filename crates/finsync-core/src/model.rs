use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Debit,
    Credit,
}

/// A user's provider connection. `item_id` is the credential the provider
/// client authenticates with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredential {
    pub user_id: String,
    pub item_id: String,
}

impl UserCredential {
    pub fn new(user_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
        }
    }
}

/// Secondary identity of an account when the provider ID is unknown or has
/// been reissued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub name: String,
    pub account_type: String,
    pub subtype: String,
}

impl AccountKey {
    pub fn new(
        name: impl Into<String>,
        account_type: impl Into<String>,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into().trim().to_string(),
            account_type: account_type.into().trim().to_string(),
            subtype: subtype.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub user_id: String,
    pub external_id: Option<String>,
    pub item_id: Option<String>,
    pub name: String,
    pub account_type: String,
    pub subtype: String,
    pub balance: Decimal,
    pub currency_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(&self.name, &self.account_type, &self.subtype)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: String,
    pub account_id: Uuid,
    pub external_id: String,
    pub description: String,
    pub category: Option<String>,
    pub status: String,
    pub notes: Option<String>,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub transaction_type: TransactionType,
    pub provider_created_at: Option<DateTime<Utc>>,
    pub provider_updated_at: Option<DateTime<Utc>>,
    /// Set once a human edits description, category, considered or notes.
    pub manipulated: bool,
    pub considered: bool,
    pub original_description: Option<String>,
    pub original_category: Option<String>,
    pub duplicate_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: Uuid,
    pub user_id: String,
    pub account_id: Uuid,
    pub external_id: String,
    pub due_date: NaiveDate,
    pub total_amount: Decimal,
    pub minimum_payment: Option<Decimal>,
    pub currency_code: String,
    pub status: String,
    pub payment_transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bill {
    pub fn is_paid(&self) -> bool {
        self.payment_transaction_id.is_some()
    }
}

/// Query-time value used to correlate a bill with its payment transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillMatchCriteria {
    pub account_id: Uuid,
    pub amount: Decimal,
    pub date_lower_bound: NaiveDate,
    pub date_upper_bound: NaiveDate,
}

impl BillMatchCriteria {
    pub fn around(account_id: Uuid, amount: Decimal, date: NaiveDate, window_days: i64) -> Self {
        let window = Duration::days(window_days.max(0));
        Self {
            account_id,
            amount: amount.abs(),
            date_lower_bound: date - window,
            date_upper_bound: date + window,
        }
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        date >= self.date_lower_bound && date <= self.date_upper_bound
    }

    /// Sign-insensitive: a bill total of 150.00 matches a payment of -150.00.
    pub fn matches_amount(&self, amount: Decimal) -> bool {
        amount.abs() == self.amount
    }
}

/// Account as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAccount {
    pub id: String,
    pub item_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
    pub subtype: String,
    pub balance: Decimal,
    #[serde(default = "default_currency")]
    pub currency_code: String,
}

impl ProviderAccount {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(&self.name, &self.account_type, &self.subtype)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTransaction {
    pub id: String,
    pub account_id: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_transaction_status")]
    pub status: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderBill {
    pub id: String,
    pub account_id: String,
    pub due_date: NaiveDate,
    pub total_amount: Decimal,
    #[serde(default)]
    pub minimum_payment_amount: Option<Decimal>,
    #[serde(default = "default_currency")]
    pub currency_code: String,
    #[serde(default = "default_bill_status")]
    pub status: String,
}

fn default_currency() -> String {
    "BRL".to_string()
}

fn default_transaction_status() -> String {
    "POSTED".to_string()
}

fn default_bill_status() -> String {
    "OPEN".to_string()
}

/// Incoming account values. When `existing_id` is set the row it names is
/// updated and re-pointed at `external_id`; otherwise the upsert is keyed on
/// `(user_id, external_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountUpsert {
    pub existing_id: Option<Uuid>,
    pub user_id: String,
    pub external_id: String,
    pub item_id: String,
    pub name: String,
    pub account_type: String,
    pub subtype: String,
    pub balance: Decimal,
    pub currency_code: String,
}

impl AccountUpsert {
    pub fn from_provider(user_id: &str, account: &ProviderAccount, existing_id: Option<Uuid>) -> Self {
        Self {
            existing_id,
            user_id: user_id.to_string(),
            external_id: account.id.clone(),
            item_id: account.item_id.clone(),
            name: account.name.trim().to_string(),
            account_type: account.account_type.trim().to_string(),
            subtype: account.subtype.trim().to_string(),
            balance: account.balance,
            currency_code: account.currency_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionUpsert {
    pub user_id: String,
    pub account_id: Uuid,
    pub external_id: String,
    pub description: String,
    pub category: Option<String>,
    pub status: String,
    pub notes: Option<String>,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub transaction_type: TransactionType,
    pub provider_created_at: Option<DateTime<Utc>>,
    pub provider_updated_at: Option<DateTime<Utc>>,
}

impl TransactionUpsert {
    pub fn from_provider(user_id: &str, account_id: Uuid, tx: &ProviderTransaction) -> Self {
        Self {
            user_id: user_id.to_string(),
            account_id,
            external_id: tx.id.clone(),
            description: tx.description.trim().to_string(),
            category: tx.category.clone(),
            status: tx.status.clone(),
            notes: None,
            amount: tx.amount,
            transaction_date: tx.date,
            transaction_type: tx.transaction_type,
            provider_created_at: tx.created_at,
            provider_updated_at: tx.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillUpsert {
    pub user_id: String,
    pub account_id: Uuid,
    pub external_id: String,
    pub due_date: NaiveDate,
    pub total_amount: Decimal,
    pub minimum_payment: Option<Decimal>,
    pub currency_code: String,
    pub status: String,
}

impl BillUpsert {
    pub fn from_provider(user_id: &str, account_id: Uuid, bill: &ProviderBill) -> Self {
        Self {
            user_id: user_id.to_string(),
            account_id,
            external_id: bill.id.clone(),
            due_date: bill.due_date,
            total_amount: bill.total_amount,
            minimum_payment: bill.minimum_payment_amount,
            currency_code: bill.currency_code.clone(),
            status: bill.status.clone(),
        }
    }
}

/// Result of one upsert statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Uuid),
    Updated(Uuid),
    /// Every updatable field already matched; nothing was written.
    Unchanged(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Updated(id) | Self::Unchanged(id) => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn criteria_window_is_inclusive_and_sign_insensitive() {
        let due = NaiveDate::from_ymd_opt(2026, 3, 10).expect("date");
        let criteria = BillMatchCriteria::around(Uuid::new_v4(), dec!(-150.00), due, 5);

        assert_eq!(criteria.amount, dec!(150.00));
        assert!(criteria.contains_date(NaiveDate::from_ymd_opt(2026, 3, 5).expect("date")));
        assert!(criteria.contains_date(NaiveDate::from_ymd_opt(2026, 3, 15).expect("date")));
        assert!(!criteria.contains_date(NaiveDate::from_ymd_opt(2026, 3, 16).expect("date")));
        assert!(criteria.matches_amount(dec!(-150)));
        assert!(!criteria.matches_amount(dec!(150.01)));
    }

    #[test]
    fn provider_transaction_parses_camel_case_payload() {
        let raw = r#"{
            "id": "tx-1",
            "accountId": "acc-1",
            "description": "UBER *TRIP",
            "amount": -23.9,
            "date": "2026-02-01",
            "type": "DEBIT"
        }"#;
        let tx: ProviderTransaction = serde_json::from_str(raw).expect("parse");
        assert_eq!(tx.account_id, "acc-1");
        assert_eq!(tx.status, "POSTED");
        assert_eq!(tx.transaction_type, TransactionType::Debit);
        assert_eq!(tx.amount, dec!(-23.9));
    }

    #[test]
    fn account_key_trims_whitespace() {
        assert_eq!(
            AccountKey::new(" Nubank ", "CREDIT", "CREDIT_CARD "),
            AccountKey::new("Nubank", "CREDIT", "CREDIT_CARD")
        );
    }
}
