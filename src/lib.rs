//! Quota-aware job orchestration.
//!
//! Work requests are accepted over HTTP, delivered to an execution webhook
//! through a durable task queue, and run on an external compute engine. Job
//! records and cached results live in a durable store with a hard daily
//! operation quota; a circuit breaker redirects to in-process storage before
//! the quota runs out and a cleanup sweeper reclaims space.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, StorageBackend};
use db::{postgres::PgDocumentStore, DocumentStore};
use services::quota::QuotaMonitor;

/// JSON logs filtered by `RUST_LOG`, `info` by default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Connect the configured durable backend and restore persisted quota usage.
pub async fn connect_storage(
    config: &AppConfig,
) -> Result<(Option<Arc<dyn DocumentStore>>, Arc<QuotaMonitor>), db::StoreError> {
    let quota = Arc::new(QuotaMonitor::new(config.quota_limits()));

    let documents: Option<Arc<dyn DocumentStore>> = match config.storage_backend {
        StorageBackend::Memory => None,
        StorageBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                db::StoreError::Unavailable("DATABASE_URL is not set".to_string())
            })?;
            tracing::info!("Connecting to PostgreSQL database");
            let pool = db::init_pool(url).await?;
            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;
            Some(Arc::new(PgDocumentStore::new(pool)))
        }
    };

    if let Some(store) = &documents {
        quota.restore(store.as_ref()).await?;
    }
    Ok((documents, quota))
}
