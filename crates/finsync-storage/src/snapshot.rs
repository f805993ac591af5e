use std::path::{Path, PathBuf};

use anyhow::Context;
use finsync_core::{Account, Bill, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub bills: Vec<Bill>,
}

#[derive(Debug, Clone)]
pub struct SavedSnapshot {
    pub content_hash: String,
    pub byte_size: usize,
    /// The file already held identical content and was left alone.
    pub unchanged: bool,
}

/// JSON file holding a [`StoreSnapshot`], replaced atomically on save.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_hash: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// A missing file loads as an empty snapshot.
    pub async fn load(&self) -> anyhow::Result<StoreSnapshot> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking snapshot path {}", self.path.display()))?
        {
            return Ok(StoreSnapshot::default());
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        *self.last_hash.lock().await = Some(Self::sha256_hex(&bytes));
        Ok(snapshot)
    }

    /// Writes through a temp file in the same directory and renames it over
    /// the target, so readers never see a partial snapshot.
    pub async fn save(&self, snapshot: &StoreSnapshot) -> anyhow::Result<SavedSnapshot> {
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        let content_hash = Self::sha256_hex(&bytes);

        let mut last_hash = self.last_hash.lock().await;
        if last_hash.as_deref() == Some(content_hash.as_str()) {
            debug!(path = %self.path.display(), "snapshot unchanged; skipping write");
            return Ok(SavedSnapshot {
                content_hash,
                byte_size: bytes.len(),
                unchanged: true,
            });
        }

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        *last_hash = Some(content_hash.clone());
        Ok(SavedSnapshot {
            content_hash,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }
}
