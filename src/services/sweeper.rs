use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{DocumentStore, RecordKey, StoreError, StoredRecord};
use crate::models::quota::QuotaCounter;
use crate::services::circuit_breaker::{CircuitBreaker, DEFAULT_BREAKER_THRESHOLD};
use crate::services::job_store::TRANSIENT_JOB_MAX_AGE;
use crate::services::periodic::spawn_periodic;
use crate::services::quota::QuotaMonitor;

pub const DEFAULT_CLEANUP_WATERMARK: f64 = 0.80;

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Storage fraction below which a pass does nothing.
    pub watermark: f64,
    pub batch_size: usize,
    /// Jobs older than this are deleted whatever their status.
    pub job_retention: Duration,
    /// Delete-counter fraction at which the sweeper stops for the day.
    pub delete_ceiling: f64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            watermark: DEFAULT_CLEANUP_WATERMARK,
            batch_size: 100,
            job_retention: TRANSIENT_JOB_MAX_AGE,
            delete_ceiling: DEFAULT_BREAKER_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub jobs_deleted: u64,
    pub cache_entries_deleted: u64,
    pub bytes_reclaimed: u64,
    pub batches: u32,
    /// Storage was under the watermark; nothing was examined.
    pub skipped: bool,
}

impl SweepReport {
    pub fn deleted(&self) -> u64 {
        self.jobs_deleted + self.cache_entries_deleted
    }
}

/// Reclaims durable storage once usage crosses the cleanup watermark.
///
/// Deletes go straight to the store, not through the breaker: the sweeper is
/// how a storage trip recovers.
pub struct CleanupSweeper {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    quota: Arc<QuotaMonitor>,
    config: SweeperConfig,
}

impl CleanupSweeper {
    pub fn new(store: Arc<dyn DocumentStore>, breaker: Arc<CircuitBreaker>, config: SweeperConfig) -> Self {
        let quota = Arc::clone(breaker.quota());
        Self {
            store,
            breaker,
            quota,
            config,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        let usage = self.quota.percentage_of(QuotaCounter::Storage);
        if usage < self.config.watermark {
            debug!(usage, watermark = self.config.watermark, "Storage under cleanup watermark");
            report.skipped = true;
            self.breaker.close_if_storage_recovered();
            return Ok(report);
        }

        info!(usage, watermark = self.config.watermark, "Storage over cleanup watermark, sweeping");
        let result = self.sweep(&mut report).await;
        self.breaker.close_if_storage_recovered();

        info!(
            jobs_deleted = report.jobs_deleted,
            cache_entries_deleted = report.cache_entries_deleted,
            bytes_reclaimed = report.bytes_reclaimed,
            batches = report.batches,
            storage = self.quota.percentage_of(QuotaCounter::Storage),
            "Cleanup pass finished"
        );
        result.map(|()| report)
    }

    async fn sweep(&self, report: &mut SweepReport) -> Result<(), StoreError> {
        while self.quota.percentage_of(QuotaCounter::Storage) >= self.config.watermark {
            let batch = self.next_batch().await?;
            if batch.is_empty() {
                info!("No eligible records left to clean up");
                break;
            }

            let before = report.deleted();
            for record in &batch {
                if self.delete_budget_exhausted() {
                    return Ok(());
                }
                self.delete(record, report).await?;
            }
            report.batches += 1;

            if report.deleted() == before {
                // Candidates vanished under us; another pass will pick up anything new.
                break;
            }
        }
        Ok(())
    }

    /// Oldest stale jobs first, topped up with expired cache entries.
    async fn next_batch(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let limit = self.config.batch_size.max(1);
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.config.job_retention)
                .unwrap_or_else(|_| chrono::Duration::zero());

        // A listing is billed per returned document, and at least one read.
        let mut batch = self.store.stale_jobs(cutoff, limit).await?;
        self.quota.record_read(batch.len().max(1) as u64);
        if batch.len() < limit {
            let remaining = limit - batch.len();
            let expired = self.store.expired_cache_entries(now, remaining).await?;
            self.quota.record_read(expired.len().max(1) as u64);
            batch.extend(expired);
        }
        Ok(batch)
    }

    async fn delete(&self, record: &StoredRecord, report: &mut SweepReport) -> Result<(), StoreError> {
        let removed = match &record.key {
            RecordKey::Job(id) => self.store.delete_job(*id).await?,
            RecordKey::Cache(fingerprint) => self.store.delete_cache_entry(fingerprint).await?,
        };

        let bytes = if removed { record.size_bytes } else { 0 };
        self.quota.record_delete(bytes);
        if !removed {
            return Ok(());
        }

        match record.key {
            RecordKey::Job(_) => report.jobs_deleted += 1,
            RecordKey::Cache(_) => report.cache_entries_deleted += 1,
        }
        report.bytes_reclaimed += bytes;
        metrics::counter!("cleanup_deleted_total").increment(1);
        Ok(())
    }

    fn delete_budget_exhausted(&self) -> bool {
        let deletes = self.quota.percentage_of(QuotaCounter::Deletes);
        if deletes >= self.config.delete_ceiling {
            warn!(deletes, ceiling = self.config.delete_ceiling, "Delete quota nearly spent, stopping cleanup");
            return true;
        }
        false
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let interval = self.config.interval;
        spawn_periodic("cleanup-sweeper", interval, token, move || {
            let sweeper = Arc::clone(&self);
            async move {
                if let Err(e) = sweeper.run_once().await {
                    warn!(error = %e, "Cleanup pass aborted");
                }
            }
        })
    }
}
