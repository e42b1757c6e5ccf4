use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::quota::QuotaLimits;
use crate::services::auth::{TaskAuthConfig, GOOGLE_ISSUER, GOOGLE_JWKS_URL};
use crate::services::bridge::RetryPolicy;
use crate::services::queue::CloudTasksConfig;
use crate::services::sweeper::SweeperConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Single process: tasks run in-process and auth may be skipped.
    Local,
    /// Behind Cloud Tasks with verified deliveries.
    Deployed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_mode")]
    pub deployment_mode: DeploymentMode,

    #[serde(default = "default_backend")]
    pub storage_backend: StorageBackend,

    /// PostgreSQL connection string, required for the postgres backend
    pub database_url: Option<String>,

    /// Accept execute deliveries without a token. Local mode only.
    #[serde(default)]
    pub skip_auth: bool,

    // Daily quota ceilings of the durable store
    #[serde(default = "default_quota_reads")]
    pub quota_daily_reads: u64,
    #[serde(default = "default_quota_writes")]
    pub quota_daily_writes: u64,
    #[serde(default = "default_quota_deletes")]
    pub quota_daily_deletes: u64,
    #[serde(default = "default_quota_storage")]
    pub quota_storage_bytes: u64,
    #[serde(default = "default_quota_flush_secs")]
    pub quota_flush_interval_secs: u64,

    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: f64,

    #[serde(default = "default_cleanup_watermark")]
    pub cleanup_watermark: f64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub transient_eviction_interval_secs: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Compute engine executable
    #[serde(default = "default_compute_program")]
    pub compute_program: String,
    /// Extra arguments, comma-separated
    #[serde(default)]
    pub compute_args: Vec<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_compute_max_attempts")]
    pub compute_max_attempts: u32,
    #[serde(default = "default_compute_retry_delay_secs")]
    pub compute_retry_delay_secs: u64,
    #[serde(default = "default_compute_timeout_secs")]
    pub compute_timeout_secs: u64,

    /// Deliveries per task in local mode, mirroring queue redelivery
    #[serde(default = "default_inline_max_deliveries")]
    pub inline_max_deliveries: u32,

    // Cloud Tasks
    pub gcp_project_id: Option<String>,
    pub gcp_location: Option<String>,
    pub tasks_queue: Option<String>,
    /// Public base URL of this service
    pub service_url: Option<String>,
    pub tasks_service_account: Option<String>,
    #[serde(default = "default_dispatch_deadline_secs")]
    pub tasks_dispatch_deadline_secs: u64,

    // Execute webhook auth
    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,
    /// Defaults to `service_url`
    pub auth_audience: Option<String>,
    pub auth_hs256_secret: Option<String>,
    #[serde(default = "default_auth_jwks_url")]
    pub auth_jwks_url: String,
    /// Defaults to `tasks_service_account`
    pub auth_allowed_email: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_mode() -> DeploymentMode {
    DeploymentMode::Local
}

fn default_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_quota_reads() -> u64 {
    QuotaLimits::default().reads
}

fn default_quota_writes() -> u64 {
    QuotaLimits::default().writes
}

fn default_quota_deletes() -> u64 {
    QuotaLimits::default().deletes
}

fn default_quota_storage() -> u64 {
    QuotaLimits::default().storage_bytes
}

fn default_quota_flush_secs() -> u64 {
    60
}

fn default_breaker_threshold() -> f64 {
    0.95
}

fn default_cleanup_watermark() -> f64 {
    0.80
}

fn default_cleanup_interval_secs() -> u64 {
    30 * 60
}

fn default_cleanup_batch_size() -> usize {
    100
}

fn default_job_retention_secs() -> u64 {
    60 * 60
}

fn default_eviction_interval_secs() -> u64 {
    5 * 60
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_compute_program() -> String {
    "jobrelay-engine".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_compute_max_attempts() -> u32 {
    3
}

fn default_compute_retry_delay_secs() -> u64 {
    5
}

fn default_compute_timeout_secs() -> u64 {
    300
}

fn default_inline_max_deliveries() -> u32 {
    1
}

fn default_dispatch_deadline_secs() -> u64 {
    30 * 60
}

fn default_auth_issuer() -> String {
    GOOGLE_ISSUER.to_string()
}

fn default_auth_jwks_url() -> String {
    GOOGLE_JWKS_URL.to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field rules serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));

        if !(self.breaker_threshold > 0.0 && self.breaker_threshold <= 1.0) {
            return invalid("BREAKER_THRESHOLD must be in (0, 1]");
        }
        if !(self.cleanup_watermark > 0.0 && self.cleanup_watermark < self.breaker_threshold) {
            return invalid("CLEANUP_WATERMARK must be positive and below BREAKER_THRESHOLD");
        }
        if self.cleanup_batch_size == 0 {
            return invalid("CLEANUP_BATCH_SIZE must be at least 1");
        }
        if self.compute_max_attempts == 0 || self.compute_timeout_secs == 0 {
            return invalid("COMPUTE_MAX_ATTEMPTS and COMPUTE_TIMEOUT_SECS must be at least 1");
        }
        if self.storage_backend == StorageBackend::Postgres && self.database_url.is_none() {
            return invalid("DATABASE_URL is required when STORAGE_BACKEND=postgres");
        }

        if self.deployment_mode == DeploymentMode::Deployed {
            if self.skip_auth {
                return invalid("SKIP_AUTH is only allowed in local mode");
            }
            if self.cloud_tasks_config().is_none() {
                return invalid(
                    "deployed mode requires GCP_PROJECT_ID, GCP_LOCATION, TASKS_QUEUE, SERVICE_URL and TASKS_SERVICE_ACCOUNT",
                );
            }
        }
        if !self.skip_auth && self.auth_config().is_none() {
            return invalid("AUTH_AUDIENCE or SERVICE_URL is required unless SKIP_AUTH=true");
        }
        Ok(())
    }

    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            reads: self.quota_daily_reads,
            writes: self.quota_daily_writes,
            deletes: self.quota_daily_deletes,
            storage_bytes: self.quota_storage_bytes,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.compute_max_attempts,
            delay: Duration::from_secs(self.compute_retry_delay_secs),
            attempt_timeout: Duration::from_secs(self.compute_timeout_secs),
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.cleanup_interval_secs),
            watermark: self.cleanup_watermark,
            batch_size: self.cleanup_batch_size,
            job_retention: self.job_retention(),
            delete_ceiling: self.breaker_threshold,
        }
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Cloud Tasks settings, when all of them are present.
    pub fn cloud_tasks_config(&self) -> Option<CloudTasksConfig> {
        Some(CloudTasksConfig {
            project_id: self.gcp_project_id.clone()?,
            location: self.gcp_location.clone()?,
            queue_name: self.tasks_queue.clone()?,
            service_url: self.service_url.clone()?,
            service_account_email: self.tasks_service_account.clone()?,
            audience: self.auth_audience.clone(),
            dispatch_deadline: Duration::from_secs(self.tasks_dispatch_deadline_secs),
        })
    }

    /// Webhook verification settings; `None` when auth is skipped or no
    /// audience can be determined.
    pub fn auth_config(&self) -> Option<TaskAuthConfig> {
        if self.skip_auth {
            return None;
        }
        let audience = self
            .auth_audience
            .clone()
            .or_else(|| {
                self.service_url
                    .as_deref()
                    .map(|url| url.trim_end_matches('/').to_string())
            })?;

        Some(TaskAuthConfig {
            issuer: self.auth_issuer.clone(),
            audience,
            hs256_secret: self.auth_hs256_secret.clone(),
            jwks_url: self.auth_jwks_url.clone(),
            allowed_email: self
                .auth_allowed_email
                .clone()
                .or_else(|| self.tasks_service_account.clone()),
        })
    }
}
