use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use finsync_core::UserCredential;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::{StoreError, UserDirectory};

#[derive(Debug, Clone, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserEntry {
    user_id: String,
    #[serde(default)]
    item_id: Option<String>,
}

/// User registry keyed by user id; `None` means no provider credential.
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: RwLock<BTreeMap<String, Option<String>>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_credentials(credentials: impl IntoIterator<Item = UserCredential>) -> Self {
        let users = credentials
            .into_iter()
            .map(|c| (c.user_id, Some(c.item_id)))
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    /// Reads a YAML registry:
    ///
    /// ```yaml
    /// users:
    ///   - user_id: alice
    ///     item_id: item-123
    ///   - user_id: bob
    /// ```
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let file: UsersFile = serde_yaml::from_str(raw).context("parsing users registry")?;
        let mut users = BTreeMap::new();
        for entry in file.users {
            let user_id = entry.user_id.trim().to_string();
            if user_id.is_empty() {
                anyhow::bail!("users registry contains an entry with an empty user_id");
            }
            let item_id = entry
                .item_id
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            users.insert(user_id, item_id);
        }
        Ok(Self {
            users: RwLock::new(users),
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn users_with_credentials(&self) -> Result<Vec<UserCredential>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .filter_map(|(user_id, item_id)| {
                item_id
                    .as_ref()
                    .map(|item_id| UserCredential::new(user_id.clone(), item_id.clone()))
            })
            .collect())
    }

    async fn all_user_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.users.read().await.keys().cloned().collect())
    }

    async fn clear_credential(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        let Some(slot) = users.get_mut(user_id) else {
            return Err(StoreError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            });
        };
        let had_credential = slot.take().is_some();
        if had_credential {
            info!(user_id, "cleared provider credential");
        }
        Ok(had_credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn yaml_registry_lists_only_users_with_credentials() {
        let directory = MemoryUserDirectory::from_yaml_str(
            "users:\n  - user_id: alice\n    item_id: item-1\n  - user_id: bob\n  - user_id: carol\n    item_id: '  '\n",
        )
        .expect("parse");

        let eligible = directory.users_with_credentials().await.expect("list");
        assert_eq!(eligible, vec![UserCredential::new("alice", "item-1")]);
        assert_eq!(
            directory.all_user_ids().await.expect("ids"),
            vec!["alice", "bob", "carol"]
        );
    }

    #[tokio::test]
    async fn clearing_a_credential_removes_user_from_eligible_set() {
        let directory =
            MemoryUserDirectory::from_credentials([UserCredential::new("alice", "item-1")]);
        assert!(directory.clear_credential("alice").await.expect("clear"));
        assert!(!directory.clear_credential("alice").await.expect("clear again"));
        assert!(directory.users_with_credentials().await.expect("list").is_empty());
        assert!(directory.clear_credential("nobody").await.is_err());
    }

    #[test]
    fn empty_user_id_is_rejected() {
        assert!(MemoryUserDirectory::from_yaml_str("users:\n  - user_id: ' '\n").is_err());
    }
}
