use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cohortsync_core::ExternalGroup;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::StoreError;

/// Last directory group list, as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedGroups {
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    pub groups: Vec<ExternalGroup>,
}

/// Outcome of one successful cache refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheRefresh {
    pub group_count: usize,
    pub content_hash: String,
    pub changed: bool,
}

/// Directory group cache, filled once per run.
#[derive(Debug, Default)]
pub struct GroupCache {
    snapshot_path: Option<PathBuf>,
    state: RwLock<Option<CachedGroups>>,
}

impl GroupCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Cache that also writes every refresh to `snapshot_path`.
    pub fn persistent(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: Some(snapshot_path.into()),
            state: RwLock::new(None),
        }
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Order-independent SHA-256 of the group list.
    pub fn content_hash(groups: &[ExternalGroup]) -> String {
        let mut sorted: Vec<&ExternalGroup> = groups.iter().collect();
        sorted.sort_by(|a, b| (&a.id, &a.display_name).cmp(&(&b.id, &b.display_name)));

        let mut hasher = Sha256::new();
        for group in sorted {
            hasher.update(group.id.as_bytes());
            hasher.update([0u8]);
            hasher.update(group.display_name.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub async fn groups(&self) -> Vec<ExternalGroup> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|cached| cached.groups.clone())
            .unwrap_or_default()
    }

    pub async fn current(&self) -> Option<CachedGroups> {
        self.state.read().await.clone()
    }

    /// Swaps in a freshly fetched list. The on-disk snapshot is replaced atomically.
    pub async fn replace(
        &self,
        groups: Vec<ExternalGroup>,
        fetched_at: DateTime<Utc>,
    ) -> Result<CacheRefresh, StoreError> {
        let content_hash = Self::content_hash(&groups);
        let previous_hash = match self.state.read().await.as_ref() {
            Some(cached) => Some(cached.content_hash.clone()),
            None => self.read_snapshot().await.map(|cached| cached.content_hash),
        };

        let cached = CachedGroups {
            fetched_at,
            content_hash: content_hash.clone(),
            groups,
        };
        if let Some(path) = &self.snapshot_path {
            write_atomically(path, &serde_json::to_vec_pretty(&cached)?).await?;
            debug!(path = %path.display(), "wrote group cache snapshot");
        }

        let refresh = CacheRefresh {
            group_count: cached.groups.len(),
            changed: previous_hash.as_deref() != Some(content_hash.as_str()),
            content_hash,
        };
        *self.state.write().await = Some(cached);
        Ok(refresh)
    }

    /// Unreadable or corrupt snapshots count as absent.
    async fn read_snapshot(&self) -> Option<CachedGroups> {
        let path = self.snapshot_path.as_ref()?;
        let bytes = fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(|e| io_err(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| io_err(&temp_path, e))?;
    file.write_all(bytes).await.map_err(|e| io_err(&temp_path, e))?;
    file.flush().await.map_err(|e| io_err(&temp_path, e))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(path, source));
    }
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
