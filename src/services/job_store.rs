//! Job lifecycle storage.
//!
//! [`MemoryJobStore`] is the transient backend; [`DurableJobStore`] routes
//! every call through the circuit breaker onto a [`DocumentStore`] and falls
//! back to a transient store whenever the breaker is open or the durable call
//! fails. Which one serves the process is fixed at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DocumentStore;
use crate::models::job::{freshest, Job, JobResult, JobStatus, StoreOutcome};
use crate::models::quota::QuotaCounter;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::periodic::spawn_periodic;
use crate::services::quota::QuotaMonitor;

/// Age after which transient jobs are evicted.
pub const TRANSIENT_JOB_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a queued job unless one already exists.
    async fn create(&self, id: Uuid) -> StoreOutcome;

    /// Write a fully formed job, replacing any existing record.
    async fn insert(&self, job: Job);

    async fn get(&self, id: Uuid) -> Option<Job>;

    async fn update_status(&self, id: Uuid, status: JobStatus, progress: Option<u8>)
        -> StoreOutcome;

    async fn complete(&self, id: Uuid, result: JobResult) -> StoreOutcome;

    async fn fail(&self, id: Uuid, error: &str) -> StoreOutcome;
}

fn log_outcome(id: Uuid, operation: &'static str, outcome: StoreOutcome) {
    match outcome {
        StoreOutcome::Applied => debug!(job_id = %id, operation, "Job updated"),
        StoreOutcome::NotFound => {
            warn!(job_id = %id, operation, "Job not found, ignoring update")
        }
        StoreOutcome::Terminal => {
            info!(job_id = %id, operation, "Job already terminal, ignoring update")
        }
        StoreOutcome::InvalidTransition => {
            warn!(job_id = %id, operation, "Rejected invalid job status transition")
        }
        StoreOutcome::AlreadyExists => {
            debug!(job_id = %id, operation, "Job already exists")
        }
    }
}

type Mutation = Box<dyn FnOnce(&mut Job, DateTime<Utc>) -> StoreOutcome + Send>;

fn status_mutation(status: JobStatus, progress: Option<u8>) -> Mutation {
    Box::new(move |job, now| job.apply_status(status, progress, now))
}

fn complete_mutation(result: JobResult) -> Mutation {
    Box::new(move |job, now| job.apply_complete(result, now))
}

fn fail_mutation(error: &str) -> Mutation {
    let error = error.to_string();
    Box::new(move |job, now| job.apply_fail(&error, now))
}

/// In-process job table.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop jobs created more than `max_age` ago, whatever their status.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, job| job.created_at >= cutoff);
        before - jobs.len()
    }

    /// Background sweep evicting old transient jobs.
    pub fn spawn_eviction(
        self: &Arc<Self>,
        period: Duration,
        max_age: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        spawn_periodic("transient-job-eviction", period, token, move || {
            let store = Arc::clone(&store);
            async move {
                let evicted = store.evict_older_than(max_age);
                if evicted > 0 {
                    info!(evicted, "Evicted expired transient jobs");
                }
            }
        })
    }

    fn mutate(&self, id: Uuid, operation: &'static str, mutation: Mutation) -> StoreOutcome {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let outcome = match jobs.get_mut(&id) {
            Some(job) => mutation(job, Utc::now()),
            None => StoreOutcome::NotFound,
        };
        drop(jobs);
        log_outcome(id, operation, outcome);
        outcome
    }

    fn get_sync(&self, id: Uuid) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn insert_sync(&self, job: Job) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, id: Uuid) -> StoreOutcome {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&id) {
            return StoreOutcome::AlreadyExists;
        }
        jobs.insert(id, Job::queued(id));
        StoreOutcome::Applied
    }

    async fn insert(&self, job: Job) {
        self.insert_sync(job);
    }

    async fn get(&self, id: Uuid) -> Option<Job> {
        self.get_sync(id)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: Option<u8>,
    ) -> StoreOutcome {
        self.mutate(id, "update_status", status_mutation(status, progress))
    }

    async fn complete(&self, id: Uuid, result: JobResult) -> StoreOutcome {
        self.mutate(id, "complete", complete_mutation(result))
    }

    async fn fail(&self, id: Uuid, error: &str) -> StoreOutcome {
        self.mutate(id, "fail", fail_mutation(error))
    }
}

/// Quota-tracked job store over the durable backend.
pub struct DurableJobStore {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    quota: Arc<QuotaMonitor>,
    fallback: Arc<MemoryJobStore>,
}

impl DurableJobStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        breaker: Arc<CircuitBreaker>,
        fallback: Arc<MemoryJobStore>,
    ) -> Self {
        let quota = Arc::clone(breaker.quota());
        Self {
            store,
            breaker,
            quota,
            fallback,
        }
    }

    /// `None` when the durable store could not be consulted.
    async fn read_durable(&self, id: Uuid) -> Option<Option<Job>> {
        let found = self
            .breaker
            .call(QuotaCounter::Reads, || self.store.get_job(id))
            .await?;
        self.quota.record_read(1);
        Some(found)
    }

    /// Stored size of the durable copy, `None` when it could not be read.
    async fn durable_size(&self, id: Uuid) -> Option<u64> {
        self.read_durable(id)
            .await
            .map(|found| found.as_ref().map_or(0, Job::size_bytes))
    }

    /// Write `job` durably, or keep it in the fallback when the durable copy
    /// is unreadable or the write is refused. `previous_size` is the size of
    /// the durable copy being replaced.
    async fn persist(&self, job: Job, previous_size: Option<u64>) -> StoreOutcome {
        let Some(previous_size) = previous_size else {
            debug!(job_id = %job.id, "Durable copy unreadable, job write served by transient store");
            self.fallback.insert_sync(job);
            return StoreOutcome::Applied;
        };

        let size = job.size_bytes();
        let written = self
            .breaker
            .call(QuotaCounter::Writes, || self.store.put_job(&job))
            .await;

        match written {
            Some(true) => {
                self.quota
                    .record_write(size as i64 - previous_size as i64);
                if self.fallback.get_sync(job.id).is_some() {
                    self.fallback.insert_sync(job);
                }
                StoreOutcome::Applied
            }
            Some(false) => {
                self.quota.record_write(0);
                StoreOutcome::Terminal
            }
            None => {
                debug!(job_id = %job.id, "Job write served by transient store");
                self.fallback.insert_sync(job);
                StoreOutcome::Applied
            }
        }
    }

    async fn mutate(&self, id: Uuid, operation: &'static str, mutation: Mutation) -> StoreOutcome {
        let local = self.fallback.get_sync(id);
        let durable = self.read_durable(id).await;
        let previous_size = durable
            .as_ref()
            .map(|found| found.as_ref().map_or(0, Job::size_bytes));
        let current = match durable {
            Some(found) => freshest(found, local),
            None => local,
        };

        let Some(mut job) = current else {
            log_outcome(id, operation, StoreOutcome::NotFound);
            return StoreOutcome::NotFound;
        };

        let mut outcome = mutation(&mut job, Utc::now());
        if outcome.is_applied() {
            outcome = self.persist(job, previous_size).await;
        }
        log_outcome(id, operation, outcome);
        outcome
    }
}

#[async_trait]
impl JobStore for DurableJobStore {
    async fn create(&self, id: Uuid) -> StoreOutcome {
        if self.fallback.get_sync(id).is_some() {
            return StoreOutcome::AlreadyExists;
        }

        let job = Job::queued(id);
        let size = job.size_bytes();
        let inserted = self
            .breaker
            .call(QuotaCounter::Writes, || self.store.insert_job(&job))
            .await;

        let outcome = match inserted {
            Some(true) => {
                self.quota.record_write(size as i64);
                StoreOutcome::Applied
            }
            Some(false) => {
                self.quota.record_write(0);
                StoreOutcome::AlreadyExists
            }
            None => {
                debug!(job_id = %id, "Job create served by transient store");
                self.fallback.insert_sync(job);
                StoreOutcome::Applied
            }
        };
        log_outcome(id, "create", outcome);
        outcome
    }

    async fn insert(&self, job: Job) {
        let previous_size = self.durable_size(job.id).await;
        self.persist(job, previous_size).await;
    }

    async fn get(&self, id: Uuid) -> Option<Job> {
        // The fallback may hold a newer copy written while the breaker was open.
        let local = self.fallback.get_sync(id);
        match self.read_durable(id).await {
            Some(durable) => freshest(durable, local),
            None => local,
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: Option<u8>,
    ) -> StoreOutcome {
        self.mutate(id, "update_status", status_mutation(status, progress))
            .await
    }

    async fn complete(&self, id: Uuid, result: JobResult) -> StoreOutcome {
        self.mutate(id, "complete", complete_mutation(result)).await
    }

    async fn fail(&self, id: Uuid, error: &str) -> StoreOutcome {
        self.mutate(id, "fail", fail_mutation(error)).await
    }
}
