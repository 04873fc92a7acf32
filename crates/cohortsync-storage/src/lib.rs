//! Mapping and cohort persistence, the directory group cache, and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use cohortsync_core::{CohortId, LocalGroup, Mapping};
use thiserror::Error;
use tokio::sync::Mutex;

mod cache;
mod http;
mod postgres;

pub use cache::{CacheRefresh, CachedGroups, GroupCache};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use postgres::{connect, run_migrations, PgCohortStore, PgMappingStore};

pub const CRATE_NAME: &str = "cohortsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// Durable `external group id -> cohort id` table.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn list_mappings(&self) -> Result<Vec<Mapping>, StoreError>;

    /// Returns `false` when the pair already existed.
    async fn add_mapping(
        &self,
        external_group_id: &str,
        local_group_id: CohortId,
    ) -> Result<bool, StoreError>;

    /// Deletes by pair. Returns `false` when no row matched; that is not an error.
    async fn delete_mapping(
        &self,
        external_group_id: &str,
        local_group_id: CohortId,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CohortStore: Send + Sync {
    async fn list_cohorts(&self) -> Result<BTreeMap<CohortId, LocalGroup>, StoreError>;

    async fn create_cohort(&self, name: &str) -> Result<CohortId, StoreError>;
}

/// Process-local mapping table.
///
/// Rows are kept as a list so that seeded duplicates survive, the way a table without a
/// uniqueness constraint would return them.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    rows: Mutex<Vec<Mapping>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mappings(rows: impl IntoIterator<Item = Mapping>) -> Self {
        Self {
            rows: Mutex::new(rows.into_iter().collect()),
        }
    }

    pub async fn snapshot(&self) -> Vec<Mapping> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn list_mappings(&self) -> Result<Vec<Mapping>, StoreError> {
        Ok(self.rows.lock().await.clone())
    }

    async fn add_mapping(
        &self,
        external_group_id: &str,
        local_group_id: CohortId,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows
            .iter()
            .any(|m| m.external_group_id == external_group_id && m.local_group_id == local_group_id)
        {
            return Ok(false);
        }
        rows.push(Mapping::new(external_group_id, local_group_id));
        Ok(true)
    }

    async fn delete_mapping(
        &self,
        external_group_id: &str,
        local_group_id: CohortId,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|m| {
            !(m.external_group_id == external_group_id && m.local_group_id == local_group_id)
        });
        Ok(rows.len() != before)
    }
}

#[derive(Debug, Default)]
struct CohortTable {
    rows: BTreeMap<CohortId, LocalGroup>,
    next_id: CohortId,
}

/// Process-local cohort table with sequential ids.
#[derive(Debug, Default)]
pub struct MemoryCohortStore {
    table: Mutex<CohortTable>,
}

impl MemoryCohortStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cohorts(rows: impl IntoIterator<Item = LocalGroup>) -> Self {
        let rows: BTreeMap<CohortId, LocalGroup> =
            rows.into_iter().map(|cohort| (cohort.id, cohort)).collect();
        let next_id = rows.keys().next_back().copied().unwrap_or(0) + 1;
        Self {
            table: Mutex::new(CohortTable { rows, next_id }),
        }
    }

    /// Removes a cohort outside the engine, the way an administrator would.
    pub async fn remove(&self, id: CohortId) -> Option<LocalGroup> {
        self.table.lock().await.rows.remove(&id)
    }

    pub async fn snapshot(&self) -> Vec<LocalGroup> {
        self.table.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl CohortStore for MemoryCohortStore {
    async fn list_cohorts(&self) -> Result<BTreeMap<CohortId, LocalGroup>, StoreError> {
        Ok(self.table.lock().await.rows.clone())
    }

    async fn create_cohort(&self, name: &str) -> Result<CohortId, StoreError> {
        let mut table = self.table.lock().await;
        let id = table.next_id.max(1);
        table.next_id = id + 1;
        table.rows.insert(id, LocalGroup::new(id, name));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_mapping_insert_is_idempotent() {
        let store = MemoryMappingStore::new();
        assert!(store.add_mapping("g1", 1).await.unwrap());
        assert!(!store.add_mapping("g1", 1).await.unwrap());
        assert!(store.add_mapping("g1", 2).await.unwrap());
        assert_eq!(store.list_mappings().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn memory_mapping_delete_tolerates_missing_rows() {
        let store = MemoryMappingStore::with_mappings([Mapping::new("g1", 1)]);
        assert!(store.delete_mapping("g1", 1).await.unwrap());
        assert!(!store.delete_mapping("g1", 1).await.unwrap());
        assert!(!store.delete_mapping("g9", 9).await.unwrap());
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn memory_mapping_delete_by_pair_removes_duplicates() {
        let store = MemoryMappingStore::with_mappings([
            Mapping::new("g1", 1),
            Mapping::new("g1", 1),
            Mapping::new("g2", 1),
        ]);
        assert!(store.delete_mapping("g1", 1).await.unwrap());
        assert_eq!(store.snapshot().await, vec![Mapping::new("g2", 1)]);
    }

    #[tokio::test]
    async fn memory_cohort_ids_continue_after_seeded_rows() {
        let store = MemoryCohortStore::with_cohorts([
            LocalGroup::new(3, "ochin-crowd-A"),
            LocalGroup::new(7, "staff"),
        ]);
        let id = store.create_cohort("ochin-crowd-B").await.unwrap();
        assert_eq!(id, 8);

        let cohorts = store.list_cohorts().await.unwrap();
        assert_eq!(cohorts.len(), 3);
        assert_eq!(cohorts[&8].name, "ochin-crowd-B");
    }

    #[tokio::test]
    async fn empty_memory_cohort_store_starts_at_one() {
        let store = MemoryCohortStore::new();
        assert_eq!(store.create_cohort("a").await.unwrap(), 1);
        assert_eq!(store.create_cohort("b").await.unwrap(), 2);
        store.remove(1).await;
        assert_eq!(store.snapshot().await, vec![LocalGroup::new(2, "b")]);
    }
}
