use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{cache_queries, queries, quota_queries, DocumentStore, StoreError, StoredRecord};
use crate::models::{cache::CacheEntry, job::Job, quota::QuotaSnapshot};

/// PostgreSQL-backed durable store.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        queries::get_job(&self.pool, id).await
    }

    async fn insert_job(&self, job: &Job) -> Result<bool, StoreError> {
        queries::insert_job(&self.pool, job).await
    }

    async fn put_job(&self, job: &Job) -> Result<bool, StoreError> {
        queries::upsert_job(&self.pool, job).await
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        queries::delete_job(&self.pool, id).await
    }

    async fn stale_jobs(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        queries::stale_jobs(&self.pool, created_before, limit).await
    }

    async fn get_cache_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>, StoreError> {
        cache_queries::get_entry(&self.pool, fingerprint).await
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        cache_queries::upsert_entry(&self.pool, entry).await
    }

    async fn delete_cache_entry(&self, fingerprint: &str) -> Result<bool, StoreError> {
        cache_queries::delete_entry(&self.pool, fingerprint).await
    }

    async fn expired_cache_entries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        cache_queries::expired_entries(&self.pool, now, limit).await
    }

    async fn load_quota(&self) -> Result<Option<QuotaSnapshot>, StoreError> {
        quota_queries::latest_snapshot(&self.pool).await
    }

    async fn save_quota(&self, snapshot: &QuotaSnapshot) -> Result<(), StoreError> {
        quota_queries::save_snapshot(&self.pool, snapshot).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
