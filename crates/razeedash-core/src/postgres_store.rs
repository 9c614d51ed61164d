//! PostgreSQL document store.
//!
//! Organizations and resource records are stored as JSONB documents in the
//! same camelCase shape the in-memory store and older server versions use.
//! Targeted updates lock the organization row, patch it in Rust, and write it
//! back in one transaction, so concurrent key and bucket updates never
//! overwrite each other.
//!
//! Feature-gated behind `postgres`.

use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Semaphore;
use tracing::info;

use crate::error::DbError;
use crate::models::{BucketConf, OrgKey, Organization, ResourceRecord};
use crate::store::{ORGS_COLLECTION, OrgStore, RESOURCES_COLLECTION, ResourceStore};

/// Upper bound on concurrent bootstrap statements.
const BOOTSTRAP_CONCURRENCY: usize = 5;

const BOOTSTRAP_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orgs (\
        id   TEXT  PRIMARY KEY, \
        name TEXT  NOT NULL UNIQUE, \
        doc  JSONB NOT NULL\
    )",
    "CREATE TABLE IF NOT EXISTS resources (\
        id     TEXT  PRIMARY KEY, \
        org_id TEXT  NOT NULL, \
        doc    JSONB NOT NULL\
    )",
];

const BOOTSTRAP_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_resources_org_id ON resources (org_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_resources_org_key_uuid ON resources ((doc->>'orgKeyUuid'))",
];

fn query_err(collection: &str) -> impl Fn(sqlx::Error) -> DbError + '_ {
    move |e| DbError::Query {
        collection: collection.to_owned(),
        reason: e.to_string(),
    }
}

/// Document store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl std::fmt::Debug for PgDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDocumentStore")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PgDocumentStore {
    /// Connect and create the tables and indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connect`] if the connection or bootstrap fails.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| DbError::Connect {
                reason: e.to_string(),
            })?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Return a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn bootstrap(&self) -> Result<(), DbError> {
        let permits = Arc::new(Semaphore::new(BOOTSTRAP_CONCURRENCY));
        for batch in [BOOTSTRAP_TABLES, BOOTSTRAP_INDEXES] {
            let statements = batch.iter().map(|sql| {
                let permits = Arc::clone(&permits);
                let pool = self.pool.clone();
                async move {
                    let _permit = permits.acquire_owned().await.map_err(|e| DbError::Connect {
                        reason: e.to_string(),
                    })?;
                    sqlx::query(sql)
                        .execute(&pool)
                        .await
                        .map_err(|e| DbError::Connect {
                            reason: format!("bootstrap failed: {e}"),
                        })
                }
            });
            futures::future::try_join_all(statements).await?;
        }
        info!("document store bootstrapped");
        Ok(())
    }

    async fn lock_org(
        tx: &mut Transaction<'_, Postgres>,
        org_id: &str,
    ) -> Result<Organization, DbError> {
        let row: Option<(Json<Organization>,)> =
            sqlx::query_as("SELECT doc FROM orgs WHERE id = $1 FOR UPDATE")
                .bind(org_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(query_err(ORGS_COLLECTION))?;
        row.map(|(Json(org),)| org).ok_or_else(|| DbError::NotFound {
            collection: ORGS_COLLECTION.to_owned(),
            id: org_id.to_owned(),
        })
    }

    /// Lock the organization row, apply `patch`, and write it back.
    async fn patch_org<F>(&self, org_id: &str, patch: F) -> Result<(), DbError>
    where
        F: FnOnce(&mut Organization) + Send,
    {
        let mut tx = self.pool.begin().await.map_err(query_err(ORGS_COLLECTION))?;
        let mut org = Self::lock_org(&mut tx, org_id).await?;
        patch(&mut org);
        org.updated = Utc::now();

        sqlx::query("UPDATE orgs SET doc = $2 WHERE id = $1")
            .bind(org_id)
            .bind(Json(&org))
            .execute(&mut *tx)
            .await
            .map_err(query_err(ORGS_COLLECTION))?;
        tx.commit().await.map_err(query_err(ORGS_COLLECTION))
    }
}

#[async_trait::async_trait]
impl OrgStore for PgDocumentStore {
    async fn find_org(&self, org_id: &str) -> Result<Option<Organization>, DbError> {
        let row: Option<(Json<Organization>,)> = sqlx::query_as("SELECT doc FROM orgs WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err(ORGS_COLLECTION))?;
        Ok(row.map(|(Json(org),)| org))
    }

    async fn find_org_by_name(&self, name: &str) -> Result<Option<Organization>, DbError> {
        let row: Option<(Json<Organization>,)> =
            sqlx::query_as("SELECT doc FROM orgs WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_err(ORGS_COLLECTION))?;
        Ok(row.map(|(Json(org),)| org))
    }

    async fn list_orgs(&self) -> Result<Vec<Organization>, DbError> {
        let rows: Vec<(Json<Organization>,)> = sqlx::query_as("SELECT doc FROM orgs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err(ORGS_COLLECTION))?;
        Ok(rows.into_iter().map(|(Json(org),)| org).collect())
    }

    async fn insert_org(&self, org: &Organization) -> Result<(), DbError> {
        let result = sqlx::query(
            "INSERT INTO orgs (id, name, doc) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(&org.id)
        .bind(&org.name)
        .bind(Json(org))
        .execute(&self.pool)
        .await
        .map_err(query_err(ORGS_COLLECTION))?;

        if result.rows_affected() == 0 {
            return Err(DbError::Conflict {
                collection: ORGS_COLLECTION.to_owned(),
                id: org.id.clone(),
            });
        }
        Ok(())
    }

    async fn update_org_keys(
        &self,
        org_id: &str,
        org_keys: &[String],
        org_keys2: &[OrgKey],
    ) -> Result<(), DbError> {
        let org_keys = org_keys.to_vec();
        let org_keys2 = org_keys2.to_vec();
        self.patch_org(org_id, move |org| {
            org.org_keys = org_keys;
            org.org_keys2 = org_keys2;
        })
        .await
    }

    async fn set_bucket(
        &self,
        org_id: &str,
        conf: &BucketConf,
        bucket: &str,
    ) -> Result<(), DbError> {
        self.patch_org(org_id, |org| org.buckets.insert(conf, bucket))
            .await
    }
}

#[async_trait::async_trait]
impl ResourceStore for PgDocumentStore {
    async fn find_resource(&self, id: &str) -> Result<Option<ResourceRecord>, DbError> {
        let row: Option<(Json<ResourceRecord>,)> =
            sqlx::query_as("SELECT doc FROM resources WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_err(RESOURCES_COLLECTION))?;
        Ok(row.map(|(Json(record),)| record))
    }

    async fn list_resources(&self, org_id: &str) -> Result<Vec<ResourceRecord>, DbError> {
        let rows: Vec<(Json<ResourceRecord>,)> =
            sqlx::query_as("SELECT doc FROM resources WHERE org_id = $1 ORDER BY id")
                .bind(org_id)
                .fetch_all(&self.pool)
                .await
                .map_err(query_err(RESOURCES_COLLECTION))?;
        Ok(rows.into_iter().map(|(Json(record),)| record).collect())
    }

    async fn save_resource(&self, record: &ResourceRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO resources (id, org_id, doc) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET org_id = EXCLUDED.org_id, doc = EXCLUDED.doc",
        )
        .bind(&record.id)
        .bind(&record.org_id)
        .bind(Json(record))
        .execute(&self.pool)
        .await
        .map_err(query_err(RESOURCES_COLLECTION))?;
        Ok(())
    }

    async fn delete_resource(&self, id: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM resources WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err(RESOURCES_COLLECTION))?;
        Ok(())
    }
}
