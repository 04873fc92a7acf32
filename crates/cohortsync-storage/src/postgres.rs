use std::collections::BTreeMap;

use async_trait::async_trait;
use cohortsync_core::{CohortId, LocalGroup, Mapping};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::{CohortStore, MappingStore, StoreError};

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn list_mappings(&self) -> Result<Vec<Mapping>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT object_id, cohort_id
              FROM cohort_group_mappings
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Mapping::new(
                row.try_get::<String, _>("object_id")?,
                row.try_get::<i64, _>("cohort_id")?,
            ));
        }
        Ok(out)
    }

    async fn add_mapping(
        &self,
        external_group_id: &str,
        local_group_id: CohortId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO cohort_group_mappings (object_id, cohort_id)
            VALUES ($1, $2)
            ON CONFLICT (object_id, cohort_id) DO NOTHING
            "#,
        )
        .bind(external_group_id)
        .bind(local_group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_mapping(
        &self,
        external_group_id: &str,
        local_group_id: CohortId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cohort_group_mappings
             WHERE object_id = $1
               AND cohort_id = $2
            "#,
        )
        .bind(external_group_id)
        .bind(local_group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
pub struct PgCohortStore {
    pool: PgPool,
}

impl PgCohortStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CohortStore for PgCohortStore {
    async fn list_cohorts(&self) -> Result<BTreeMap<CohortId, LocalGroup>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name
              FROM cohorts
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            out.insert(id, LocalGroup::new(id, row.try_get::<String, _>("name")?));
        }
        Ok(out)
    }

    async fn create_cohort(&self, name: &str) -> Result<CohortId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO cohorts (name)
            VALUES ($1)
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }
}
