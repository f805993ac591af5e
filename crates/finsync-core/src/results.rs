use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::UpsertOutcome;

/// Error lists shown to admins are cut after this many entries.
pub const MAX_REPORTED_ERRORS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Account,
    Transaction,
    Bill,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Transaction => "transaction",
            Self::Bill => "bill",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one sync pass over one entity kind for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub owner_key: String,
    pub kind: SyncKind,
    pub items_found: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn new(owner_key: impl Into<String>, kind: SyncKind) -> Self {
        Self {
            owner_key: owner_key.into(),
            kind,
            items_found: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            errors: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created(_) => self.created += 1,
            UpsertOutcome::Updated(_) => self.updated += 1,
            UpsertOutcome::Unchanged(_) => {}
        }
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} sync for {}: found={} created={} updated={} skipped={} errors={}",
            self.kind,
            self.owner_key,
            self.items_found,
            self.created,
            self.updated,
            self.skipped,
            self.errors.len()
        );
        if !self.errors.is_empty() {
            line.push_str(" [");
            line.push_str(&cap_errors(&self.errors, MAX_REPORTED_ERRORS));
            line.push(']');
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCheckResult {
    pub transactions_checked: usize,
    pub duplicates_found: usize,
    pub duplicates_marked: usize,
    pub errors: Vec<String>,
}

impl DuplicateCheckResult {
    pub fn absorb(&mut self, other: DuplicateCheckResult) {
        self.transactions_checked += other.transactions_checked;
        self.duplicates_found += other.duplicates_found;
        self.duplicates_marked += other.duplicates_marked;
        self.errors.extend(other.errors);
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "checked={} found={} marked={}",
            self.transactions_checked, self.duplicates_found, self.duplicates_marked
        );
        if !self.errors.is_empty() {
            line.push_str(&format!(
                " errors={} [{}]",
                self.errors.len(),
                cap_errors(&self.errors, MAX_REPORTED_ERRORS)
            ));
        }
        line
    }
}

/// Joins at most `limit` errors, appending `"... and N more"` for the rest.
pub fn cap_errors(errors: &[String], limit: usize) -> String {
    let mut shown = errors.iter().take(limit).cloned().collect::<Vec<_>>().join("; ");
    if errors.len() > limit {
        shown.push_str(&format!("; ... and {} more", errors.len() - limit));
    }
    shown
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn unchanged_outcomes_are_not_counted() {
        let mut result = SyncResult::new("user-1", SyncKind::Transaction);
        result.record(UpsertOutcome::Created(Uuid::nil()));
        result.record(UpsertOutcome::Updated(Uuid::nil()));
        result.record(UpsertOutcome::Unchanged(Uuid::nil()));
        result.skip();
        assert_eq!((result.created, result.updated, result.skipped), (1, 1, 1));
    }

    #[test]
    fn errors_are_capped_with_remainder_suffix() {
        let errors = (1..=8).map(|i| format!("e{i}")).collect::<Vec<_>>();
        assert_eq!(
            cap_errors(&errors, MAX_REPORTED_ERRORS),
            "e1; e2; e3; e4; e5; ... and 3 more"
        );
        assert_eq!(cap_errors(&errors[..2], MAX_REPORTED_ERRORS), "e1; e2");
    }

    #[test]
    fn duplicate_results_accumulate() {
        let mut total = DuplicateCheckResult::default();
        total.absorb(DuplicateCheckResult {
            transactions_checked: 4,
            duplicates_found: 1,
            duplicates_marked: 1,
            errors: vec![],
        });
        total.absorb(DuplicateCheckResult {
            transactions_checked: 2,
            duplicates_found: 1,
            duplicates_marked: 0,
            errors: vec!["boom".into()],
        });
        assert_eq!(total.summary(), "checked=6 found=2 marked=1 errors=1 [boom]");
    }
}
