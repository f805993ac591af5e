use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use finsync_core::{
    normalize_description, BillMatchCriteria, DuplicateCheckResult, SyncContext, Transaction,
};
use finsync_storage::{BillRepository, TransactionRepository};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SyncError;

#[derive(Debug, Clone, Copy)]
pub struct DuplicateConfig {
    /// Users scanned concurrently by the multi-user check.
    pub workers: usize,
    pub date_tolerance_days: i64,
    /// Half-width of the window around a bill's due date.
    pub payment_window_days: i64,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            date_tolerance_days: 3,
            payment_window_days: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub canonical: Uuid,
    pub duplicates: Vec<Uuid>,
}

/// Groups transactions sharing account, amount and normalized description,
/// then splits each group into clusters whose dates lie within
/// `tolerance_days` of the cluster's first date. The earliest-created member
/// of every multi-member cluster is canonical.
///
/// Rows already marked as duplicates are ignored.
pub fn find_duplicate_groups(transactions: &[Transaction], tolerance_days: i64) -> Vec<DuplicateGroup> {
    let mut by_key: BTreeMap<(Uuid, Decimal, String), Vec<&Transaction>> = BTreeMap::new();
    for tx in transactions.iter().filter(|t| !t.is_duplicate()) {
        by_key
            .entry((
                tx.account_id,
                tx.amount.normalize(),
                normalize_description(&tx.description),
            ))
            .or_default()
            .push(tx);
    }

    let mut groups = Vec::new();
    for (_, mut members) in by_key {
        if members.len() < 2 {
            continue;
        }
        members.sort_by_key(|t| (t.transaction_date, t.created_at, t.id));

        let mut cluster: Vec<&Transaction> = Vec::new();
        let mut anchor: Option<NaiveDate> = None;
        for tx in members {
            let within = anchor
                .map(|first| (tx.transaction_date - first).num_days() <= tolerance_days)
                .unwrap_or(false);
            if !within {
                groups.extend(close_cluster(&cluster));
                cluster.clear();
                anchor = Some(tx.transaction_date);
            }
            cluster.push(tx);
        }
        groups.extend(close_cluster(&cluster));
    }
    groups
}

fn close_cluster(cluster: &[&Transaction]) -> Option<DuplicateGroup> {
    if cluster.len() < 2 {
        return None;
    }
    let canonical = cluster.iter().min_by_key(|t| (t.created_at, t.id))?;
    let mut duplicates: Vec<Uuid> = cluster
        .iter()
        .filter(|t| t.id != canonical.id)
        .map(|t| t.id)
        .collect();
    duplicates.sort();
    Some(DuplicateGroup {
        canonical: canonical.id,
        duplicates,
    })
}

/// Scans stored transactions and bill payments for near-duplicates and
/// marks them. Independent of the sync pool; the multi-user scan runs its
/// own bounded concurrency.
pub struct DuplicateDetector {
    transactions: Arc<dyn TransactionRepository>,
    bills: Arc<dyn BillRepository>,
    config: DuplicateConfig,
}

impl DuplicateDetector {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        bills: Arc<dyn BillRepository>,
        config: DuplicateConfig,
    ) -> Self {
        Self {
            transactions,
            bills,
            config,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    pub fn config(&self) -> &DuplicateConfig {
        &self.config
    }

    /// Transaction pass followed by a bill pass over the user's bills.
    pub async fn check_all_user_transactions(
        &self,
        ctx: &SyncContext,
        user_id: &str,
    ) -> Result<DuplicateCheckResult, SyncError> {
        ctx.ensure_active()?;
        let mut result = DuplicateCheckResult::default();

        let live: Vec<Transaction> = ctx
            .run(self.transactions.list_by_user(user_id))
            .await??
            .into_iter()
            .filter(|t| !t.is_duplicate())
            .collect();
        result.transactions_checked = live.len();

        for group in find_duplicate_groups(&live, self.config.date_tolerance_days) {
            result.duplicates_found += group.duplicates.len();
            for duplicate in &group.duplicates {
                ctx.ensure_active()?;
                match self.transactions.mark_duplicate(*duplicate, group.canonical).await {
                    Ok(true) => result.duplicates_marked += 1,
                    Ok(false) => {}
                    Err(err) => result
                        .errors
                        .push(format!("transaction {duplicate}: {err}")),
                }
            }
        }

        let bills = ctx.run(self.bills.list_by_user(user_id)).await??;
        for bill in bills {
            match self
                .check_bill_for_duplicates(ctx, bill.account_id, bill.due_date, bill.total_amount, user_id)
                .await
            {
                Ok((found, marked)) => {
                    result.duplicates_found += found;
                    result.duplicates_marked += marked;
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => result.errors.push(format!("bill {}: {err}", bill.id)),
            }
        }

        info!(
            user_id,
            checked = result.transactions_checked,
            found = result.duplicates_found,
            marked = result.duplicates_marked,
            errors = result.errors.len(),
            "duplicate check finished"
        );
        Ok(result)
    }

    /// One result per requested user. A failing user gets its error in its own
    /// result; the others are unaffected.
    pub async fn check_all_users_transactions(
        &self,
        ctx: &SyncContext,
        user_ids: &[String],
    ) -> HashMap<String, DuplicateCheckResult> {
        stream::iter(user_ids.iter().cloned())
            .map(|user_id| async move {
                let result = match self.check_all_user_transactions(ctx, &user_id).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(user_id = %user_id, error = %err, "duplicate check failed");
                        DuplicateCheckResult {
                            errors: vec![err.to_string()],
                            ..DuplicateCheckResult::default()
                        }
                    }
                };
                (user_id, result)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await
    }

    /// Payment transactions on `account_id` within the window around
    /// `due_date` whose absolute amount equals `total_amount`, grouped by
    /// sign and normalized description. In every group with more than one
    /// member all but the earliest-created are marked duplicates of it.
    pub async fn check_bill_for_duplicates(
        &self,
        ctx: &SyncContext,
        account_id: Uuid,
        due_date: NaiveDate,
        total_amount: Decimal,
        user_id: &str,
    ) -> Result<(usize, usize), SyncError> {
        ctx.ensure_active()?;
        let criteria = BillMatchCriteria::around(
            account_id,
            total_amount,
            due_date,
            self.config.payment_window_days,
        );
        let candidates = ctx
            .run(self.transactions.find_payment_candidates(user_id, &criteria))
            .await??;

        let mut groups: BTreeMap<(bool, String), Vec<&Transaction>> = BTreeMap::new();
        for tx in &candidates {
            groups
                .entry((
                    tx.amount.is_sign_negative(),
                    normalize_description(&tx.description),
                ))
                .or_default()
                .push(tx);
        }

        let mut found = 0;
        let mut marked = 0;
        for members in groups.values().filter(|m| m.len() > 1) {
            let Some(canonical) = members.iter().min_by_key(|t| (t.created_at, t.id)) else {
                continue;
            };
            for duplicate in members.iter().filter(|t| t.id != canonical.id) {
                ctx.ensure_active()?;
                found += 1;
                if self.transactions.mark_duplicate(duplicate.id, canonical.id).await? {
                    marked += 1;
                }
            }
        }
        debug!(user_id, %account_id, %due_date, found, marked, "bill payment duplicates");
        Ok((found, marked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use finsync_core::{Bill, TransactionType};
    use finsync_storage::MemoryStore;
    use rust_decimal_macros::dec;

    fn tx(account_id: Uuid, description: &str, amount: Decimal, day: u32, created_offset: i64) -> Transaction {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(created_offset);
        Transaction {
            id: Uuid::new_v4(),
            user_id: "user-1".into(),
            account_id,
            external_id: Uuid::new_v4().to_string(),
            description: description.into(),
            category: None,
            status: "POSTED".into(),
            notes: None,
            amount,
            transaction_date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            transaction_type: TransactionType::Debit,
            provider_created_at: None,
            provider_updated_at: None,
            manipulated: false,
            considered: true,
            original_description: None,
            original_category: None,
            duplicate_of: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn detector(store: &Arc<MemoryStore>) -> DuplicateDetector {
        DuplicateDetector::new(store.clone(), store.clone(), DuplicateConfig::default())
    }

    #[test]
    fn groups_respect_tolerance_and_description() {
        let account = Uuid::new_v4();
        let a = tx(account, "Padaria  Pão*Quente", dec!(-12.50), 1, 0);
        let b = tx(account, "padaria pão quente", dec!(-12.5), 4, 1);
        let c = tx(account, "padaria pão quente", dec!(-12.50), 9, 2);
        let d = tx(account, "mercado", dec!(-12.50), 1, 3);

        let groups = find_duplicate_groups(&[a.clone(), b.clone(), c, d], 3);
        assert_eq!(
            groups,
            vec![DuplicateGroup {
                canonical: a.id,
                duplicates: vec![b.id],
            }]
        );
    }

    #[test]
    fn canonical_is_earliest_created_not_earliest_dated() {
        let account = Uuid::new_v4();
        let later_dated = tx(account, "uber trip", dec!(-30), 2, 0);
        let earlier_dated = tx(account, "uber trip", dec!(-30), 1, 10);
        let groups = find_duplicate_groups(&[earlier_dated.clone(), later_dated.clone()], 3);
        assert_eq!(groups[0].canonical, later_dated.id);
        assert_eq!(groups[0].duplicates, vec![earlier_dated.id]);
    }

    #[tokio::test]
    async fn two_payments_one_day_apart_mark_the_later_created() {
        let store = Arc::new(MemoryStore::new());
        let account = Uuid::new_v4();
        let first = tx(account, "PIX Maria Silva", dec!(150.00), 10, 0);
        let second = tx(account, "pix - maria silva", dec!(150.00), 11, 5);
        store.insert_transaction(first.clone()).await;
        store.insert_transaction(second.clone()).await;

        let result = detector(&store)
            .check_all_user_transactions(&SyncContext::new(), "user-1")
            .await
            .expect("check");
        assert_eq!(result.transactions_checked, 2);
        assert_eq!(result.duplicates_found, 1);
        assert_eq!(result.duplicates_marked, 1);

        let kept = TransactionRepository::get_by_id(store.as_ref(), first.id)
            .await
            .expect("get")
            .expect("row");
        let marked = TransactionRepository::get_by_id(store.as_ref(), second.id)
            .await
            .expect("get")
            .expect("row");
        assert!(!kept.is_duplicate());
        assert_eq!(marked.duplicate_of, Some(first.id));

        let rerun = detector(&store)
            .check_all_user_transactions(&SyncContext::new(), "user-1")
            .await
            .expect("rerun");
        assert_eq!((rerun.duplicates_found, rerun.duplicates_marked), (0, 0));
    }

    fn bill(account_id: Uuid, day: u32, total: Decimal, payment: Option<Uuid>) -> Bill {
        let now = Utc::now();
        Bill {
            id: Uuid::new_v4(),
            user_id: "user-1".into(),
            account_id,
            external_id: Uuid::new_v4().to_string(),
            due_date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            total_amount: total,
            minimum_payment: None,
            currency_code: "BRL".into(),
            status: "CLOSED".into(),
            payment_transaction_id: payment,
            created_at: now,
            updated_at: now,
        }
    }

    async fn check_bill(store: &Arc<MemoryStore>, account: Uuid, day: u32) -> (usize, usize) {
        detector(store)
            .check_bill_for_duplicates(
                &SyncContext::new(),
                account,
                NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
                dec!(150.00),
                "user-1",
            )
            .await
            .expect("bill check")
    }

    #[tokio::test]
    async fn bill_pass_only_marks_same_description_and_sign() {
        let store = Arc::new(MemoryStore::new());
        let account = Uuid::new_v4();
        let payment = tx(account, "PAGAMENTO FATURA", dec!(-150.00), 10, 0);
        let repeat = tx(account, "pagamento - fatura", dec!(-150.00), 11, 5);
        let pharmacy = tx(account, "FARMACIA SAO JOAO", dec!(-150.00), 8, 1);
        let mut refund = tx(account, "pagamento fatura", dec!(150.00), 12, 2);
        refund.transaction_type = TransactionType::Credit;
        for row in [&payment, &repeat, &pharmacy, &refund] {
            store.insert_transaction(row.clone()).await;
        }
        store.insert_bill(bill(account, 10, dec!(150.00), Some(payment.id))).await;

        assert_eq!(check_bill(&store, account, 10).await, (1, 1));

        let get = |id| {
            let store = store.clone();
            async move {
                TransactionRepository::get_by_id(store.as_ref(), id)
                    .await
                    .expect("get")
                    .expect("row")
            }
        };
        assert_eq!(get(repeat.id).await.duplicate_of, Some(payment.id));
        assert!(!get(payment.id).await.is_duplicate());
        assert!(!get(pharmacy.id).await.is_duplicate());
        assert!(!get(refund.id).await.is_duplicate());
    }

    #[tokio::test]
    async fn overlapping_bills_agree_on_the_earliest_created_payment() {
        let store = Arc::new(MemoryStore::new());
        let account = Uuid::new_v4();
        let late = tx(account, "pagamento fatura", dec!(-150.00), 10, 5);
        let early = tx(account, "pagamento fatura", dec!(-150.00), 11, 0);
        store.insert_transaction(late.clone()).await;
        store.insert_transaction(early.clone()).await;
        store.insert_bill(bill(account, 10, dec!(150.00), Some(late.id))).await;
        store.insert_bill(bill(account, 12, dec!(150.00), Some(early.id))).await;

        assert_eq!(check_bill(&store, account, 10).await, (1, 1));
        assert_eq!(check_bill(&store, account, 12).await, (0, 0));

        let late = TransactionRepository::get_by_id(store.as_ref(), late.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(late.duplicate_of, Some(early.id));
    }

    #[tokio::test]
    async fn multi_user_scan_reports_every_user() {
        let store = Arc::new(MemoryStore::new());
        let account = Uuid::new_v4();
        store.insert_transaction(tx(account, "cafe", dec!(-8), 1, 0)).await;
        store.insert_transaction(tx(account, "cafe", dec!(-8), 2, 1)).await;

        let users = vec!["user-1".to_string(), "user-2".to_string()];
        let results = detector(&store)
            .with_workers(2)
            .check_all_users_transactions(&SyncContext::new(), &users)
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["user-1"].duplicates_marked, 1);
        assert_eq!(results["user-2"], DuplicateCheckResult::default());
    }

    #[tokio::test]
    async fn cancelled_scan_lands_in_each_user_result() {
        let store = Arc::new(MemoryStore::new());
        let ctx = SyncContext::new();
        ctx.cancel();
        let results = detector(&store)
            .check_all_users_transactions(&ctx, &["user-1".to_string()])
            .await;
        assert_eq!(results["user-1"].errors, vec!["sync cancelled".to_string()]);
    }
}
