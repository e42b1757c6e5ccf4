use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::models::job::{
    sanitize_error, JobResult, JobStatus, StoreOutcome, PROCESSING_STARTED_PROGRESS,
};
use crate::models::task::ExecuteTask;
use crate::services::bridge::ProcessBridge;
use crate::services::job_store::JobStore;
use crate::services::result_cache::ResultCache;

/// What one delivery of an execute task achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(JobResult),
    /// Redelivery for a job that already finished; nothing changed.
    AlreadyTerminal(JobStatus),
    /// Another delivery is processing this job right now.
    InFlight,
    Failed { error: String, retryable: bool },
}

/// Drives one job from queued to a terminal state.
pub struct ExecutionCoordinator {
    jobs: Arc<dyn JobStore>,
    cache: Arc<dyn ResultCache>,
    bridge: Arc<ProcessBridge>,
    cache_ttl: Duration,
    stale_after: Duration,
}

impl ExecutionCoordinator {
    /// A `processing` job untouched for longer than the bridge's full retry
    /// budget is treated as abandoned and picked up again.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        cache: Arc<dyn ResultCache>,
        bridge: Arc<ProcessBridge>,
        cache_ttl: Duration,
    ) -> Self {
        let stale_after = bridge.policy().budget();
        Self {
            jobs,
            cache,
            bridge,
            cache_ttl,
            stale_after,
        }
    }

    pub async fn execute(&self, task: ExecuteTask) -> ExecutionOutcome {
        let job_id = task.job_id;

        let job = match self.jobs.get(job_id).await {
            Some(job) => job,
            None => {
                warn!(job_id = %job_id, "Execute task for unknown job, creating record");
                self.jobs.create(job_id).await;
                match self.jobs.get(job_id).await {
                    Some(job) => job,
                    None => {
                        error!(job_id = %job_id, "Job record could not be created");
                        return ExecutionOutcome::Failed {
                            error: "job record unavailable".to_string(),
                            retryable: true,
                        };
                    }
                }
            }
        };

        if job.is_terminal() {
            info!(job_id = %job_id, status = %job.status, "Job already terminal, acknowledging redelivery");
            return ExecutionOutcome::AlreadyTerminal(job.status);
        }

        if job.status == JobStatus::Processing {
            let idle = (Utc::now() - job.updated_at).to_std().unwrap_or_default();
            if idle < self.stale_after {
                info!(job_id = %job_id, idle_secs = idle.as_secs(), "Job already being processed");
                return ExecutionOutcome::InFlight;
            }
            warn!(job_id = %job_id, idle_secs = idle.as_secs(), "Resuming stale processing job");
        }

        let claimed = self
            .jobs
            .update_status(job_id, JobStatus::Processing, Some(PROCESSING_STARTED_PROGRESS))
            .await;
        if claimed == StoreOutcome::Terminal {
            // Another delivery finished the job between the read and the claim.
            return match self.jobs.get(job_id).await {
                Some(job) if job.is_terminal() => {
                    info!(job_id = %job_id, status = %job.status, "Job finished concurrently, acknowledging redelivery");
                    ExecutionOutcome::AlreadyTerminal(job.status)
                }
                _ => ExecutionOutcome::InFlight,
            };
        }

        match self.bridge.execute(job_id, &task.params).await {
            Ok(result) => {
                self.cache
                    .store(&task.params.fingerprint(), result.clone(), self.cache_ttl)
                    .await;
                self.jobs.complete(job_id, result.clone()).await;
                metrics::counter!("jobs_completed_total").increment(1);
                info!(job_id = %job_id, artifact = %result.artifact, "Job completed");
                ExecutionOutcome::Completed(result)
            }
            Err(e) => {
                let message = sanitize_error(&e.to_string());
                self.jobs.fail(job_id, &message).await;
                metrics::counter!("jobs_failed_total").increment(1);
                error!(job_id = %job_id, error = %message, "Job failed");
                ExecutionOutcome::Failed {
                    error: message,
                    retryable: e.is_retryable(),
                }
            }
        }
    }
}
