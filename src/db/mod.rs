use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{cache::CacheEntry, job::Job, quota::QuotaSnapshot};

pub mod cache_queries;
pub mod postgres;
pub mod queries;
pub mod quota_queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Key of a record eligible for cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Job(Uuid),
    Cache(String),
}

/// A cleanup candidate with the bytes it accounts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: RecordKey,
    pub size_bytes: u64,
    /// Creation time for jobs, expiry time for cache entries.
    pub timestamp: DateTime<Utc>,
}

/// The quota-limited durable backend: `jobs/{id}`, `cache/{fingerprint}`
/// and one `quota/{date}` record per day.
///
/// Implementations do no quota accounting themselves; callers route every
/// call through the circuit breaker and report usage to the quota monitor.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Insert only if no record exists. Returns whether it was inserted.
    async fn insert_job(&self, job: &Job) -> Result<bool, StoreError>;

    /// Insert or overwrite, unless the stored record is already terminal.
    /// Returns whether the record was written.
    async fn put_job(&self, job: &Job) -> Result<bool, StoreError>;

    /// Returns whether a record was removed. Deleting a missing id is not an error.
    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Jobs created before `created_before`, oldest first.
    async fn stale_jobs(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    async fn get_cache_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    async fn delete_cache_entry(&self, fingerprint: &str) -> Result<bool, StoreError>;

    /// Cache entries expired at `now`, oldest expiry first.
    async fn expired_cache_entries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Most recent persisted quota snapshot, if any.
    async fn load_quota(&self) -> Result<Option<QuotaSnapshot>, StoreError>;

    async fn save_quota(&self, snapshot: &QuotaSnapshot) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
