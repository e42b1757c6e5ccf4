use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AppConfig, ConfigError, DeploymentMode};
use crate::db::DocumentStore;
use crate::models::quota::StorageStatus;
use crate::services::{
    auth::{TaskAuthenticator, TaskVerifier},
    bridge::ProcessBridge,
    circuit_breaker::CircuitBreaker,
    compute::ComputeEngine,
    coordinator::ExecutionCoordinator,
    dispatcher::TaskDispatcher,
    job_store::{DurableJobStore, JobStore, MemoryJobStore},
    periodic::spawn_periodic,
    queue::{CloudTasksQueue, InlineQueue, TaskQueue},
    quota::QuotaMonitor,
    result_cache::{DurableResultCache, MemoryResultCache, ResultCache},
    sweeper::CleanupSweeper,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub cache: Arc<dyn ResultCache>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub auth: Arc<TaskAuthenticator>,
    pub quota: Arc<QuotaMonitor>,
    pub breaker: Arc<CircuitBreaker>,
    /// Durable backend, absent with `STORAGE_BACKEND=memory`.
    pub documents: Option<Arc<dyn DocumentStore>>,
    /// In-process queue, present in local mode.
    pub inline: Option<Arc<InlineQueue>>,
    pub transient_jobs: Arc<MemoryJobStore>,
    pub transient_cache: Arc<MemoryResultCache>,
    pub sweeper: Option<Arc<CleanupSweeper>>,
}

impl AppState {
    /// Wire every service from configuration.
    ///
    /// `documents` selects the durable backend; without it jobs and cached
    /// results live only in process memory.
    pub fn build(
        config: &AppConfig,
        documents: Option<Arc<dyn DocumentStore>>,
        quota: Arc<QuotaMonitor>,
        engine: Arc<dyn ComputeEngine>,
    ) -> Result<Self, ConfigError> {
        let breaker = Arc::new(CircuitBreaker::new(Arc::clone(&quota), config.breaker_threshold));
        let transient_jobs = Arc::new(MemoryJobStore::new());
        let transient_cache = Arc::new(MemoryResultCache::new());

        let (jobs, cache): (Arc<dyn JobStore>, Arc<dyn ResultCache>) = match &documents {
            Some(store) => {
                let jobs: Arc<dyn JobStore> = Arc::new(DurableJobStore::new(
                    Arc::clone(store),
                    Arc::clone(&breaker),
                    Arc::clone(&transient_jobs),
                ));
                let cache: Arc<dyn ResultCache> = Arc::new(DurableResultCache::new(
                    Arc::clone(store),
                    Arc::clone(&breaker),
                    Arc::clone(&transient_cache),
                ));
                (jobs, cache)
            }
            None => {
                let jobs: Arc<dyn JobStore> = transient_jobs.clone();
                let cache: Arc<dyn ResultCache> = transient_cache.clone();
                (jobs, cache)
            }
        };

        let bridge = Arc::new(ProcessBridge::new(
            engine,
            config.retry_policy(),
            config.output_dir.clone(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&jobs),
            Arc::clone(&cache),
            bridge,
            config.cache_ttl(),
        ));

        let (queue, inline): (Arc<dyn TaskQueue>, Option<Arc<InlineQueue>>) =
            match config.deployment_mode {
                DeploymentMode::Deployed => {
                    let tasks = config.cloud_tasks_config().ok_or_else(|| {
                        ConfigError::Invalid("Cloud Tasks settings are incomplete".to_string())
                    })?;
                    let queue: Arc<dyn TaskQueue> = Arc::new(
                        CloudTasksQueue::new(tasks)
                            .map_err(|e| ConfigError::Invalid(e.to_string()))?,
                    );
                    (queue, None)
                }
                DeploymentMode::Local => {
                    let inline = Arc::new(
                        InlineQueue::new(Arc::clone(&coordinator)).with_redelivery(
                            config.inline_max_deliveries,
                            Duration::from_secs(config.compute_retry_delay_secs),
                        ),
                    );
                    let queue: Arc<dyn TaskQueue> = inline.clone();
                    (queue, Some(inline))
                }
            };

        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&jobs),
            Arc::clone(&cache),
            queue,
        ));

        let auth = match config.auth_config() {
            Some(auth) => TaskAuthenticator::Verify(TaskVerifier::new(auth)),
            None => {
                warn!("Execute webhook authentication is disabled");
                TaskAuthenticator::Disabled
            }
        };

        let sweeper = documents.as_ref().map(|store| {
            Arc::new(CleanupSweeper::new(
                Arc::clone(store),
                Arc::clone(&breaker),
                config.sweeper_config(),
            ))
        });

        Ok(Self {
            jobs,
            cache,
            dispatcher,
            coordinator,
            auth: Arc::new(auth),
            quota,
            breaker,
            documents,
            inline,
            transient_jobs,
            transient_cache,
            sweeper,
        })
    }

    pub fn storage_status(&self) -> StorageStatus {
        StorageStatus {
            enabled: self.documents.is_some(),
            circuit_breaker: self.breaker.report(),
            quotas: self.quota.report(),
        }
    }

    /// Start eviction, quota flushing and cleanup; all stop on `token`.
    pub fn spawn_background_tasks(
        &self,
        config: &AppConfig,
        token: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let eviction = Duration::from_secs(config.transient_eviction_interval_secs);
        let mut handles = vec![
            self.transient_jobs
                .spawn_eviction(eviction, config.job_retention(), token.clone()),
            self.transient_cache.spawn_purge(eviction, token.clone()),
        ];

        if let Some(store) = &self.documents {
            let quota = Arc::clone(&self.quota);
            let store = Arc::clone(store);
            handles.push(spawn_periodic(
                "quota-flush",
                Duration::from_secs(config.quota_flush_interval_secs),
                token.clone(),
                move || {
                    let quota = Arc::clone(&quota);
                    let store = Arc::clone(&store);
                    async move {
                        if let Err(e) = quota.flush(store.as_ref()).await {
                            warn!(error = %e, "Failed to persist quota usage");
                        }
                    }
                },
            ));
        }

        if let Some(sweeper) = &self.sweeper {
            handles.push(Arc::clone(sweeper).spawn(token.clone()));
        }

        info!(tasks = handles.len(), "Background tasks started");
        handles
    }

    /// Wait for in-process tasks and persist quota usage one last time.
    pub async fn shutdown(&self) {
        if let Some(inline) = &self.inline {
            info!(in_flight = inline.in_flight(), "Draining in-process tasks");
            inline.drain().await;
        }
        if let Some(store) = &self.documents {
            match self.quota.flush(store.as_ref()).await {
                Ok(_) => info!("Quota usage persisted"),
                Err(e) => warn!(error = %e, "Failed to persist quota usage on shutdown"),
            }
        }
    }
}
