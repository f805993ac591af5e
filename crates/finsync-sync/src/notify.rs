use std::path::Path;

use anyhow::Context;
use finsync_core::SyncResult;
use serde::Deserialize;
use tracing::info;

/// Fire-and-forget user notifications. Implementations must not block.
pub trait SyncNotifier: Send + Sync {
    fn sync_complete(&self, user_id: &str, results: &[SyncResult]);
    fn credential_cleared(&self, user_id: &str);
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

impl SyncNotifier for NoopNotifier {
    fn sync_complete(&self, _user_id: &str, _results: &[SyncResult]) {}
    fn credential_cleared(&self, _user_id: &str) {}
}

/// Message templates, loaded once at startup and handed to the notifier.
/// Placeholders: `{user_id}`, `{created}`, `{updated}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationMessages {
    pub sync_complete: String,
    pub credential_cleared: String,
}

impl Default for NotificationMessages {
    fn default() -> Self {
        Self {
            sync_complete: "Sync finished: {created} new and {updated} updated records.".into(),
            credential_cleared:
                "Your bank connection expired. Reconnect it to keep your data up to date.".into(),
        }
    }
}

impl NotificationMessages {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(raw).context("parsing notification messages")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn render_sync_complete(&self, user_id: &str, results: &[SyncResult]) -> String {
        let created: usize = results.iter().map(|r| r.created).sum();
        let updated: usize = results.iter().map(|r| r.updated).sum();
        self.sync_complete
            .replace("{user_id}", user_id)
            .replace("{created}", &created.to_string())
            .replace("{updated}", &updated.to_string())
    }

    pub fn render_credential_cleared(&self, user_id: &str) -> String {
        self.credential_cleared.replace("{user_id}", user_id)
    }
}

/// Emits notifications as tracing events; stands in for push delivery.
#[derive(Debug, Default)]
pub struct LogNotifier {
    messages: NotificationMessages,
}

impl LogNotifier {
    pub fn new(messages: NotificationMessages) -> Self {
        Self { messages }
    }
}

impl SyncNotifier for LogNotifier {
    fn sync_complete(&self, user_id: &str, results: &[SyncResult]) {
        info!(
            user_id,
            notification = "sync_complete",
            message = %self.messages.render_sync_complete(user_id, results),
            "notify user"
        );
    }

    fn credential_cleared(&self, user_id: &str) {
        info!(
            user_id,
            notification = "credential_cleared",
            message = %self.messages.render_credential_cleared(user_id),
            "notify user"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsync_core::SyncKind;

    #[test]
    fn templates_fill_counts_across_steps() {
        let messages = NotificationMessages::from_yaml_str(
            "sync_complete: \"{user_id}: +{created} ~{updated}\"\n",
        )
        .expect("parse");
        let mut accounts = SyncResult::new("alice", SyncKind::Account);
        accounts.created = 1;
        let mut transactions = SyncResult::new("alice", SyncKind::Transaction);
        transactions.created = 4;
        transactions.updated = 2;

        assert_eq!(
            messages.render_sync_complete("alice", &[accounts, transactions]),
            "alice: +5 ~2"
        );
        assert_eq!(
            messages.credential_cleared,
            NotificationMessages::default().credential_cleared
        );
    }
}
