#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use finsync_core::{ProviderAccount, ProviderBill, ProviderTransaction, TransactionType};
use finsync_provider::{ProviderClient, ProviderFixture, StaticProviderClient};
use finsync_storage::MemoryStore;
use finsync_sync::{ReconcileConfig, SyncServices};
use rust_decimal::Decimal;

pub fn days_ago(days: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(days)
}

pub fn nubank(id: &str, balance: Decimal) -> ProviderAccount {
    ProviderAccount {
        id: id.to_string(),
        item_id: "item-1".to_string(),
        name: "Nubank".to_string(),
        account_type: "CREDIT".to_string(),
        subtype: "CREDIT_CARD".to_string(),
        balance,
        currency_code: "BRL".to_string(),
    }
}

pub fn checking(id: &str, balance: Decimal) -> ProviderAccount {
    ProviderAccount {
        id: id.to_string(),
        item_id: "item-1".to_string(),
        name: "Conta Corrente".to_string(),
        account_type: "BANK".to_string(),
        subtype: "CHECKING_ACCOUNT".to_string(),
        balance,
        currency_code: "BRL".to_string(),
    }
}

pub fn provider_tx(
    id: &str,
    account_id: &str,
    description: &str,
    category: Option<&str>,
    amount: Decimal,
    date: NaiveDate,
) -> ProviderTransaction {
    ProviderTransaction {
        id: id.to_string(),
        account_id: account_id.to_string(),
        description: description.to_string(),
        category: category.map(str::to_string),
        status: "POSTED".to_string(),
        amount,
        date,
        transaction_type: if amount.is_sign_negative() {
            TransactionType::Debit
        } else {
            TransactionType::Credit
        },
        created_at: None,
        updated_at: None,
    }
}

pub fn provider_bill(id: &str, account_id: &str, total: Decimal, due: NaiveDate) -> ProviderBill {
    ProviderBill {
        id: id.to_string(),
        account_id: account_id.to_string(),
        due_date: due,
        total_amount: total,
        minimum_payment_amount: None,
        currency_code: "BRL".to_string(),
        status: "CLOSED".to_string(),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<StaticProviderClient>,
    pub services: SyncServices,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(StaticProviderClient::new());
        let client: Arc<dyn ProviderClient> = provider.clone();
        let services = SyncServices::new(client, store.clone(), &ReconcileConfig::default());
        Self {
            store,
            provider,
            services,
        }
    }

    pub async fn set(&self, user_id: &str, fixture: ProviderFixture) {
        self.provider.set_fixture(user_id, fixture).await;
    }
}
