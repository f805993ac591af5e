//! Merge rules applied by repositories when provider data meets existing rows.
//!
//! Every `merge_*` function returns `None` when the incoming values would not
//! change any updatable field, so callers can skip the write entirely and
//! leave `updated_at` untouched.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    Account, AccountUpsert, Bill, BillUpsert, Transaction, TransactionUpsert,
};

pub fn new_account(incoming: &AccountUpsert, now: DateTime<Utc>) -> Account {
    Account {
        id: Uuid::new_v4(),
        user_id: incoming.user_id.clone(),
        external_id: Some(incoming.external_id.clone()),
        item_id: Some(incoming.item_id.clone()),
        name: incoming.name.clone(),
        account_type: incoming.account_type.clone(),
        subtype: incoming.subtype.clone(),
        balance: incoming.balance,
        currency_code: incoming.currency_code.clone(),
        created_at: now,
        updated_at: now,
    }
}

pub fn merge_account(
    current: &Account,
    incoming: &AccountUpsert,
    now: DateTime<Utc>,
) -> Option<Account> {
    let mut next = current.clone();
    next.external_id = Some(incoming.external_id.clone());
    next.item_id = Some(incoming.item_id.clone());
    next.name = incoming.name.clone();
    next.account_type = incoming.account_type.clone();
    next.subtype = incoming.subtype.clone();
    next.balance = incoming.balance;
    next.currency_code = incoming.currency_code.clone();

    if next == *current {
        return None;
    }
    next.updated_at = now;
    Some(next)
}

pub fn new_transaction(incoming: &TransactionUpsert, now: DateTime<Utc>) -> Transaction {
    Transaction {
        id: Uuid::new_v4(),
        user_id: incoming.user_id.clone(),
        account_id: incoming.account_id,
        external_id: incoming.external_id.clone(),
        description: incoming.description.clone(),
        category: incoming.category.clone(),
        status: incoming.status.clone(),
        notes: incoming.notes.clone(),
        amount: incoming.amount,
        transaction_date: incoming.transaction_date,
        transaction_type: incoming.transaction_type,
        provider_created_at: incoming.provider_created_at,
        provider_updated_at: incoming.provider_updated_at,
        manipulated: false,
        considered: true,
        original_description: None,
        original_category: None,
        duplicate_of: None,
        created_at: now,
        updated_at: now,
    }
}

/// Provider-driven update of an existing transaction.
///
/// Amount, date, type and provider timestamps always follow the provider. The
/// user-facing fields (description, category, status, notes) only follow it
/// while the row is not `manipulated`; when a provider value first diverges
/// from the stored one, the stored value is kept in `original_*`.
pub fn merge_transaction(
    current: &Transaction,
    incoming: &TransactionUpsert,
    now: DateTime<Utc>,
) -> Option<Transaction> {
    let mut next = current.clone();
    next.account_id = incoming.account_id;
    next.amount = incoming.amount;
    next.transaction_date = incoming.transaction_date;
    next.transaction_type = incoming.transaction_type;
    next.provider_created_at = incoming.provider_created_at;
    next.provider_updated_at = incoming.provider_updated_at;

    if !current.manipulated {
        if next.original_description.is_none() && current.description != incoming.description {
            next.original_description = Some(current.description.clone());
        }
        if next.original_category.is_none() && current.category != incoming.category {
            next.original_category = current.category.clone();
        }
        next.description = incoming.description.clone();
        next.category = incoming.category.clone();
        next.status = incoming.status.clone();
        next.notes = incoming.notes.clone();
    }

    if next == *current {
        return None;
    }
    next.updated_at = now;
    Some(next)
}

/// Fields a human may change on a transaction. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserEdit {
    pub description: Option<String>,
    pub category: Option<String>,
    pub considered: Option<bool>,
    pub notes: Option<String>,
}

/// Applies a manual edit, flags the row as manipulated and keeps the
/// provider's values recoverable in `original_*`.
pub fn apply_user_edit(current: &Transaction, edit: &UserEdit, now: DateTime<Utc>) -> Transaction {
    let mut next = current.clone();
    if let Some(description) = &edit.description {
        if next.original_description.is_none() {
            next.original_description = Some(current.description.clone());
        }
        next.description = description.clone();
    }
    if let Some(category) = &edit.category {
        if next.original_category.is_none() {
            next.original_category = current.category.clone();
        }
        next.category = Some(category.clone());
    }
    if let Some(considered) = edit.considered {
        next.considered = considered;
    }
    if let Some(notes) = &edit.notes {
        next.notes = Some(notes.clone());
    }
    next.manipulated = true;
    next.updated_at = now;
    next
}

pub fn new_bill(incoming: &BillUpsert, now: DateTime<Utc>) -> Bill {
    Bill {
        id: Uuid::new_v4(),
        user_id: incoming.user_id.clone(),
        account_id: incoming.account_id,
        external_id: incoming.external_id.clone(),
        due_date: incoming.due_date,
        total_amount: incoming.total_amount,
        minimum_payment: incoming.minimum_payment,
        currency_code: incoming.currency_code.clone(),
        status: incoming.status.clone(),
        payment_transaction_id: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn merge_bill(current: &Bill, incoming: &BillUpsert, now: DateTime<Utc>) -> Option<Bill> {
    let mut next = current.clone();
    next.account_id = incoming.account_id;
    next.due_date = incoming.due_date;
    next.total_amount = incoming.total_amount;
    next.minimum_payment = incoming.minimum_payment;
    next.currency_code = incoming.currency_code.clone();
    next.status = incoming.status.clone();

    if next == *current {
        return None;
    }
    next.updated_at = now;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionType;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().expect("ts")
    }

    fn incoming() -> TransactionUpsert {
        TransactionUpsert {
            user_id: "user-1".into(),
            account_id: Uuid::nil(),
            external_id: "tx-1".into(),
            description: "IFOOD *RESTAURANTE".into(),
            category: Some("Food".into()),
            status: "POSTED".into(),
            notes: None,
            amount: dec!(-42.50),
            transaction_date: NaiveDate::from_ymd_opt(2026, 2, 20).expect("date"),
            transaction_type: TransactionType::Debit,
            provider_created_at: None,
            provider_updated_at: None,
        }
    }

    #[test]
    fn identical_values_are_a_no_op() {
        let stored = new_transaction(&incoming(), at(8));
        assert!(merge_transaction(&stored, &incoming(), at(9)).is_none());
    }

    #[test]
    fn provider_change_keeps_first_seen_values() {
        let stored = new_transaction(&incoming(), at(8));
        let mut changed = incoming();
        changed.description = "IFOOD RESTAURANTE LTDA".into();
        changed.category = Some("Restaurants".into());

        let merged = merge_transaction(&stored, &changed, at(9)).expect("changed");
        assert_eq!(merged.description, "IFOOD RESTAURANTE LTDA");
        assert_eq!(merged.original_description.as_deref(), Some("IFOOD *RESTAURANTE"));
        assert_eq!(merged.original_category.as_deref(), Some("Food"));
        assert_eq!(merged.updated_at, at(9));

        let mut again = changed.clone();
        again.description = "IFOOD".into();
        let merged_again = merge_transaction(&merged, &again, at(10)).expect("changed");
        assert_eq!(merged_again.original_description.as_deref(), Some("IFOOD *RESTAURANTE"));
    }

    #[test]
    fn manipulated_rows_keep_user_fields_but_follow_amount_and_date() {
        let stored = new_transaction(&incoming(), at(8));
        let edited = apply_user_edit(
            &stored,
            &UserEdit {
                category: Some("Dining out".into()),
                notes: Some("team lunch".into()),
                ..UserEdit::default()
            },
            at(9),
        );
        assert!(edited.manipulated);
        assert_eq!(edited.original_category.as_deref(), Some("Food"));

        let mut changed = incoming();
        changed.category = Some("Groceries".into());
        changed.status = "PENDING".into();
        changed.amount = dec!(-45.00);
        changed.transaction_date = NaiveDate::from_ymd_opt(2026, 2, 21).expect("date");

        let merged = merge_transaction(&edited, &changed, at(10)).expect("changed");
        assert_eq!(merged.category.as_deref(), Some("Dining out"));
        assert_eq!(merged.notes.as_deref(), Some("team lunch"));
        assert_eq!(merged.status, "POSTED");
        assert_eq!(merged.amount, dec!(-45.00));
        assert_eq!(merged.transaction_date, changed.transaction_date);
    }

    #[test]
    fn manipulated_rows_ignore_user_field_changes_entirely() {
        let stored = new_transaction(&incoming(), at(8));
        let edited = apply_user_edit(
            &stored,
            &UserEdit {
                description: Some("Lunch".into()),
                ..UserEdit::default()
            },
            at(9),
        );
        let mut changed = incoming();
        changed.description = "Something else".into();
        assert!(merge_transaction(&edited, &changed, at(10)).is_none());
    }

    #[test]
    fn bill_merge_preserves_payment_link() {
        let upsert = BillUpsert {
            user_id: "user-1".into(),
            account_id: Uuid::nil(),
            external_id: "bill-1".into(),
            due_date: NaiveDate::from_ymd_opt(2026, 3, 10).expect("date"),
            total_amount: dec!(1200.00),
            minimum_payment: Some(dec!(120.00)),
            currency_code: "BRL".into(),
            status: "OPEN".into(),
        };
        let mut stored = new_bill(&upsert, at(8));
        stored.payment_transaction_id = Some(Uuid::new_v4());

        assert!(merge_bill(&stored, &upsert, at(9)).is_none());

        let mut closed = upsert.clone();
        closed.status = "CLOSED".into();
        let merged = merge_bill(&stored, &closed, at(9)).expect("changed");
        assert_eq!(merged.payment_transaction_id, stored.payment_transaction_id);
        assert_eq!(merged.status, "CLOSED");
    }
}
