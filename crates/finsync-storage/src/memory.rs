use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use finsync_core::{
    apply_user_edit, merge_account, merge_bill, merge_transaction, new_account, new_bill,
    new_transaction, Account, AccountKey, AccountUpsert, Bill, BillMatchCriteria, BillUpsert,
    Transaction, TransactionUpsert, UpsertOutcome, UserEdit,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::snapshot::StoreSnapshot;
use crate::{AccountRepository, BillRepository, StoreError, TransactionRepository};

trait Row: Clone {
    const ENTITY: &'static str;

    fn id(&self) -> Uuid;
    fn user_id(&self) -> &str;
    fn external_id(&self) -> Option<&str>;
}

impl Row for Account {
    const ENTITY: &'static str = "account";

    fn id(&self) -> Uuid {
        self.id
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
    fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }
}

impl Row for Transaction {
    const ENTITY: &'static str = "transaction";

    fn id(&self) -> Uuid {
        self.id
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
    fn external_id(&self) -> Option<&str> {
        Some(&self.external_id)
    }
}

impl Row for Bill {
    const ENTITY: &'static str = "bill";

    fn id(&self) -> Uuid {
        self.id
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
    fn external_id(&self) -> Option<&str> {
        Some(&self.external_id)
    }
}

/// Rows plus a unique `(user_id, external_id)` index.
#[derive(Debug)]
struct Table<T> {
    rows: HashMap<Uuid, T>,
    by_external: HashMap<(String, String), Uuid>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            by_external: HashMap::new(),
        }
    }
}

impl<T: Row> Table<T> {
    fn from_rows(rows: Vec<T>) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.put(row);
        }
        table
    }

    fn get(&self, id: Uuid) -> Option<&T> {
        self.rows.get(&id)
    }

    fn require(&self, id: Uuid) -> Result<&T, StoreError> {
        self.rows.get(&id).ok_or_else(|| StoreError::NotFound {
            entity: T::ENTITY,
            id: id.to_string(),
        })
    }

    fn find_external(&self, user_id: &str, external_id: &str) -> Option<&T> {
        self.by_external
            .get(&(user_id.to_string(), external_id.to_string()))
            .and_then(|id| self.rows.get(id))
    }

    fn put(&mut self, row: T) {
        if let Some(previous) = self.rows.get(&row.id()) {
            if let Some(ext) = previous.external_id() {
                self.by_external
                    .remove(&(previous.user_id().to_string(), ext.to_string()));
            }
        }
        if let Some(ext) = row.external_id() {
            self.by_external
                .insert((row.user_id().to_string(), ext.to_string()), row.id());
        }
        self.rows.insert(row.id(), row);
    }

    fn for_user(&self, user_id: &str) -> impl Iterator<Item = &T> + '_ {
        let user_id = user_id.to_string();
        self.rows.values().filter(move |row| row.user_id() == user_id)
    }

    fn all(&self) -> Vec<T> {
        self.rows.values().cloned().collect()
    }
}

/// In-process store backing all three repositories. Each upsert runs under
/// the table's write lock, so it behaves like a single statement.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: RwLock<Table<Account>>,
    transactions: RwLock<Table<Transaction>>,
    bills: RwLock<Table<Bill>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            accounts: RwLock::new(Table::from_rows(snapshot.accounts)),
            transactions: RwLock::new(Table::from_rows(snapshot.transactions)),
            bills: RwLock::new(Table::from_rows(snapshot.bills)),
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot {
            accounts: self.accounts.read().await.all(),
            transactions: self.transactions.read().await.all(),
            bills: self.bills.read().await.all(),
        };
        snapshot.accounts.sort_by_key(|a| (a.created_at, a.id));
        snapshot.transactions.sort_by_key(|t| (t.created_at, t.id));
        snapshot.bills.sort_by_key(|b| (b.created_at, b.id));
        snapshot
    }

    /// Stores rows verbatim, for seeding and imports.
    pub async fn insert_account(&self, account: Account) {
        self.accounts.write().await.put(account);
    }

    pub async fn insert_transaction(&self, transaction: Transaction) {
        self.transactions.write().await.put(transaction);
    }

    pub async fn insert_bill(&self, bill: Bill) {
        self.bills.write().await.put(bill);
    }

    /// Manual edit coming from the user-facing CRUD surface.
    pub async fn apply_user_edit(
        &self,
        id: Uuid,
        edit: &UserEdit,
    ) -> Result<Transaction, StoreError> {
        let mut table = self.transactions.write().await;
        let edited = apply_user_edit(table.require(id)?, edit, Utc::now());
        table.put(edited.clone());
        Ok(edited)
    }
}

fn sorted_by_creation<T, K: Ord>(mut rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    rows.sort_by_key(|row| key(row));
    rows
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.read().await.get(id).cloned())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Account>, StoreError> {
        let rows = self.accounts.read().await.for_user(user_id).cloned().collect();
        Ok(sorted_by_creation(rows, |a: &Account| (a.created_at, a.id)))
    }

    async fn find_by_name_type_subtype(
        &self,
        user_id: &str,
        key: &AccountKey,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self
            .accounts
            .read()
            .await
            .for_user(user_id)
            .filter(|a| &a.key() == key)
            .min_by_key(|a| (a.created_at, a.id))
            .cloned())
    }

    async fn upsert(&self, params: AccountUpsert) -> Result<UpsertOutcome, StoreError> {
        if params.external_id.trim().is_empty() {
            return Err(StoreError::Invalid("account external id is empty".into()));
        }
        let now = Utc::now();
        let mut table = self.accounts.write().await;
        let current = match params.existing_id {
            Some(id) => Some(table.require(id)?.clone()),
            None => table.find_external(&params.user_id, &params.external_id).cloned(),
        };

        let Some(current) = current else {
            let account = new_account(&params, now);
            let id = account.id;
            table.put(account);
            return Ok(UpsertOutcome::Created(id));
        };

        if current.user_id != params.user_id {
            return Err(StoreError::Conflict(format!(
                "account {} belongs to another user",
                current.id
            )));
        }
        if let Some(owner) = table.find_external(&params.user_id, &params.external_id) {
            if owner.id != current.id {
                return Err(StoreError::Conflict(format!(
                    "external id {} already linked to account {}",
                    params.external_id, owner.id
                )));
            }
        }

        match merge_account(&current, &params, now) {
            None => Ok(UpsertOutcome::Unchanged(current.id)),
            Some(next) => {
                table.put(next);
                Ok(UpsertOutcome::Updated(current.id))
            }
        }
    }
}

#[async_trait]
impl TransactionRepository for MemoryStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Transaction>, StoreError> {
        Ok(self.transactions.read().await.get(id).cloned())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Transaction>, StoreError> {
        let rows = self.transactions.read().await.for_user(user_id).cloned().collect();
        Ok(sorted_by_creation(rows, |t: &Transaction| (t.created_at, t.id)))
    }

    async fn upsert(&self, params: TransactionUpsert) -> Result<UpsertOutcome, StoreError> {
        if params.external_id.trim().is_empty() {
            return Err(StoreError::Invalid("transaction external id is empty".into()));
        }
        let now = Utc::now();
        let mut table = self.transactions.write().await;
        match table.find_external(&params.user_id, &params.external_id).cloned() {
            None => {
                let tx = new_transaction(&params, now);
                let id = tx.id;
                table.put(tx);
                Ok(UpsertOutcome::Created(id))
            }
            Some(current) => match merge_transaction(&current, &params, now) {
                None => Ok(UpsertOutcome::Unchanged(current.id)),
                Some(next) => {
                    table.put(next);
                    Ok(UpsertOutcome::Updated(current.id))
                }
            },
        }
    }

    async fn find_payment_candidates(
        &self,
        user_id: &str,
        criteria: &BillMatchCriteria,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = self
            .transactions
            .read()
            .await
            .for_user(user_id)
            .filter(|t| {
                t.account_id == criteria.account_id
                    && !t.is_duplicate()
                    && criteria.contains_date(t.transaction_date)
                    && criteria.matches_amount(t.amount)
            })
            .cloned()
            .collect();
        Ok(sorted_by_creation(rows, |t: &Transaction| (t.created_at, t.id)))
    }

    async fn mark_duplicate(&self, id: Uuid, canonical_id: Uuid) -> Result<bool, StoreError> {
        if id == canonical_id {
            return Err(StoreError::Conflict(format!(
                "transaction {id} cannot duplicate itself"
            )));
        }
        let mut table = self.transactions.write().await;
        table.require(canonical_id)?;
        let current = table.require(id)?;
        if current.duplicate_of == Some(canonical_id) {
            return Ok(false);
        }
        let mut next = current.clone();
        next.duplicate_of = Some(canonical_id);
        next.updated_at = Utc::now();
        table.put(next);
        Ok(true)
    }
}

#[async_trait]
impl BillRepository for MemoryStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Bill>, StoreError> {
        Ok(self.bills.read().await.get(id).cloned())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Bill>, StoreError> {
        let rows = self.bills.read().await.for_user(user_id).cloned().collect();
        Ok(sorted_by_creation(rows, |b: &Bill| (b.created_at, b.id)))
    }

    async fn upsert(&self, params: BillUpsert) -> Result<UpsertOutcome, StoreError> {
        if params.external_id.trim().is_empty() {
            return Err(StoreError::Invalid("bill external id is empty".into()));
        }
        let now = Utc::now();
        let mut table = self.bills.write().await;
        match table.find_external(&params.user_id, &params.external_id).cloned() {
            None => {
                let bill = new_bill(&params, now);
                let id = bill.id;
                table.put(bill);
                Ok(UpsertOutcome::Created(id))
            }
            Some(current) => match merge_bill(&current, &params, now) {
                None => Ok(UpsertOutcome::Unchanged(current.id)),
                Some(next) => {
                    table.put(next);
                    Ok(UpsertOutcome::Updated(current.id))
                }
            },
        }
    }

    async fn find_matching_bill(
        &self,
        user_id: &str,
        criteria: &BillMatchCriteria,
    ) -> Result<Option<Bill>, StoreError> {
        Ok(self
            .bills
            .read()
            .await
            .for_user(user_id)
            .filter(|b| {
                b.account_id == criteria.account_id
                    && criteria.contains_date(b.due_date)
                    && criteria.matches_amount(b.total_amount)
            })
            .min_by_key(|b| (b.due_date, b.created_at))
            .cloned())
    }

    async fn set_payment_transaction(
        &self,
        bill_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut table = self.bills.write().await;
        let current = table.require(bill_id)?;
        if current.payment_transaction_id == Some(transaction_id) {
            return Ok(false);
        }
        let mut next = current.clone();
        next.payment_transaction_id = Some(transaction_id);
        next.updated_at = Utc::now();
        table.put(next);
        Ok(true)
    }
}
