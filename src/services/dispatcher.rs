use garde::Validate;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::models::task::{ExecuteTask, JobParams, SubmitReceipt};
use crate::services::job_store::JobStore;
use crate::services::queue::{QueueError, TaskQueue};
use crate::services::result_cache::ResultCache;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("task queue unavailable: {0}")]
    Queue(#[from] QueueError),
}

/// Accepts work requests and hands them to the task queue without waiting
/// for compute.
pub struct TaskDispatcher {
    jobs: Arc<dyn JobStore>,
    cache: Arc<dyn ResultCache>,
    queue: Arc<dyn TaskQueue>,
}

impl TaskDispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        cache: Arc<dyn ResultCache>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self { jobs, cache, queue }
    }

    pub async fn submit(&self, params: JobParams) -> Result<SubmitReceipt, DispatchError> {
        params
            .validate()
            .map_err(|e| DispatchError::InvalidParams(e.to_string()))?;

        let fingerprint = params.fingerprint();
        let job_id = Uuid::new_v4();

        if let Some(entry) = self.cache.lookup(&fingerprint).await {
            self.jobs.insert(Job::completed(job_id, entry.result)).await;
            metrics::counter!("cache_hits_total").increment(1);
            info!(job_id = %job_id, fingerprint = %fingerprint, "Submission served from result cache");
            return Ok(SubmitReceipt {
                job_id,
                status: JobStatus::Completed,
                cached: true,
            });
        }

        self.jobs.create(job_id).await;
        metrics::counter!("jobs_submitted_total").increment(1);

        let task = ExecuteTask { job_id, params };
        if let Err(e) = self.queue.enqueue(&task).await {
            error!(job_id = %job_id, error = %e, "Failed to enqueue job");
            self.jobs
                .fail(job_id, "could not schedule job execution")
                .await;
            return Err(DispatchError::Queue(e));
        }

        info!(job_id = %job_id, fingerprint = %fingerprint, "Job queued");
        Ok(SubmitReceipt {
            job_id,
            status: JobStatus::Queued,
            cached: false,
        })
    }
}
