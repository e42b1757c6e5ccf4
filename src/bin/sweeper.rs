//! One cleanup pass against the durable store, for cron-style scheduling.

use std::sync::Arc;

use jobrelay::config::AppConfig;
use jobrelay::services::circuit_breaker::CircuitBreaker;
use jobrelay::services::sweeper::CleanupSweeper;

#[tokio::main]
async fn main() {
    jobrelay::init_tracing();

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let (documents, quota) = jobrelay::connect_storage(&config)
        .await
        .expect("Failed to initialize durable storage");
    let store = documents.expect("Cleanup requires STORAGE_BACKEND=postgres");

    let breaker = Arc::new(CircuitBreaker::new(quota.clone(), config.breaker_threshold));
    let sweeper = CleanupSweeper::new(store.clone(), breaker, config.sweeper_config());

    let outcome = sweeper.run_once().await;

    if let Err(e) = quota.flush(store.as_ref()).await {
        tracing::warn!(error = %e, "Failed to persist quota usage");
    }

    match outcome {
        Ok(report) => tracing::info!(
            jobs_deleted = report.jobs_deleted,
            cache_entries_deleted = report.cache_entries_deleted,
            bytes_reclaimed = report.bytes_reclaimed,
            skipped = report.skipped,
            "Cleanup run complete"
        ),
        Err(e) => {
            tracing::error!(error = %e, "Cleanup run failed");
            std::process::exit(1);
        }
    }
}
