//! Delivery of execute tasks to the coordinator.
//!
//! Deployed instances go through Cloud Tasks, which calls
//! `POST /_internal/execute` with an OIDC-signed request and redelivers on
//! retryable responses. Local mode runs the coordinator in-process.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::models::task::ExecuteTask;
use crate::services::coordinator::{ExecutionCoordinator, ExecutionOutcome};

/// Path the queue delivers execute tasks to.
pub const EXECUTE_PATH: &str = "/_internal/execute";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const CLOUD_TASKS_API: &str = "https://cloudtasks.googleapis.com/v2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueReceipt {
    Enqueued { task_name: String },
    /// The queue already holds a task for this job.
    Deduplicated { task_name: String },
    /// Handed to the in-process coordinator.
    Inline,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &ExecuteTask) -> Result<EnqueueReceipt, QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Cloud Tasks API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("access token unavailable: {0}")]
    Auth(String),
}

#[derive(Debug, Clone)]
pub struct CloudTasksConfig {
    pub project_id: String,
    pub location: String,
    pub queue_name: String,
    /// Public base URL of this service; tasks target `{service_url}/_internal/execute`.
    pub service_url: String,
    /// Service account the OIDC token is minted for.
    pub service_account_email: String,
    /// OIDC audience; defaults to the service URL.
    pub audience: Option<String>,
    /// How long the queue waits for the coordinator to answer.
    pub dispatch_deadline: Duration,
}

impl CloudTasksConfig {
    pub fn queue_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.project_id, self.location, self.queue_name
        )
    }

    /// Task names are derived from the job id so a repeated enqueue for the
    /// same job is rejected by the queue.
    pub fn task_name(&self, task: &ExecuteTask) -> String {
        format!("{}/tasks/job-{}", self.queue_path(), task.job_id.simple())
    }

    pub fn target_url(&self) -> String {
        format!("{}{}", self.service_url.trim_end_matches('/'), EXECUTE_PATH)
    }

    fn audience(&self) -> String {
        self.audience
            .clone()
            .unwrap_or_else(|| self.service_url.trim_end_matches('/').to_string())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    task: CloudTask,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloudTask {
    name: String,
    http_request: HttpRequest,
    dispatch_deadline: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequest {
    url: String,
    http_method: &'static str,
    headers: HashMap<String, String>,
    /// Base64-encoded JSON body.
    body: String,
    oidc_token: OidcToken,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcToken {
    service_account_email: String,
    audience: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Creates HTTP tasks through the Cloud Tasks REST API.
pub struct CloudTasksQueue {
    config: CloudTasksConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl CloudTasksQueue {
    pub fn new(config: CloudTasksConfig) -> Result<Self, QueueError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CloudTasksConfig {
        &self.config
    }

    fn build_request(&self, task: &ExecuteTask) -> Result<CreateTaskRequest, QueueError> {
        let body = serde_json::to_vec(task)?;
        Ok(CreateTaskRequest {
            task: CloudTask {
                name: self.config.task_name(task),
                http_request: HttpRequest {
                    url: self.config.target_url(),
                    http_method: "POST",
                    headers: HashMap::from([(
                        "Content-Type".to_string(),
                        "application/json".to_string(),
                    )]),
                    body: base64::engine::general_purpose::STANDARD.encode(body),
                    oidc_token: OidcToken {
                        service_account_email: self.config.service_account_email.clone(),
                        audience: self.config.audience(),
                    },
                },
                dispatch_deadline: format!("{}s", self.config.dispatch_deadline.as_secs()),
            },
        })
    }

    /// Access token for the Cloud Tasks API from the metadata server, cached
    /// until shortly before it expires.
    async fn access_token(&self) -> Result<String, QueueError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Auth(format!(
                "metadata server returned {status}: {body}"
            )));
        }

        let token: MetadataToken = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl TaskQueue for CloudTasksQueue {
    async fn enqueue(&self, task: &ExecuteTask) -> Result<EnqueueReceipt, QueueError> {
        let request = self.build_request(task)?;
        let task_name = request.task.name.clone();
        let token = self.access_token().await?;

        let url = format!("{CLOUD_TASKS_API}/{}/tasks", self.config.queue_path());
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(job_id = %task.job_id, task_name = %task_name, "Task enqueued");
            return Ok(EnqueueReceipt::Enqueued { task_name });
        }
        if status == reqwest::StatusCode::CONFLICT {
            debug!(job_id = %task.job_id, task_name = %task_name, "Task already enqueued");
            return Ok(EnqueueReceipt::Deduplicated { task_name });
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        Err(QueueError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Runs tasks on the in-process coordinator.
///
/// Mirrors queue redelivery: a retryable outcome is re-run after
/// `redelivery_delay`, up to `max_deliveries` deliveries in total.
pub struct InlineQueue {
    coordinator: Arc<ExecutionCoordinator>,
    tracker: TaskTracker,
    max_deliveries: u32,
    redelivery_delay: Duration,
}

impl InlineQueue {
    pub fn new(coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self {
            coordinator,
            tracker: TaskTracker::new(),
            max_deliveries: 1,
            redelivery_delay: Duration::from_secs(10),
        }
    }

    pub fn with_redelivery(mut self, max_deliveries: u32, delay: Duration) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self.redelivery_delay = delay;
        self
    }

    /// Wait for every in-flight task to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

#[async_trait]
impl TaskQueue for InlineQueue {
    async fn enqueue(&self, task: &ExecuteTask) -> Result<EnqueueReceipt, QueueError> {
        let coordinator = Arc::clone(&self.coordinator);
        let task = task.clone();
        let max_deliveries = self.max_deliveries;
        let delay = self.redelivery_delay;

        self.tracker.spawn(async move {
            for delivery in 1..=max_deliveries {
                let outcome = coordinator.execute(task.clone()).await;
                let retry = matches!(
                    outcome,
                    ExecutionOutcome::Failed { retryable: true, .. } | ExecutionOutcome::InFlight
                );
                if !retry || delivery == max_deliveries {
                    break;
                }
                warn!(job_id = %task.job_id, delivery, "Redelivering inline task");
                tokio::time::sleep(delay).await;
            }
        });
        Ok(EnqueueReceipt::Inline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::JobParams;
    use serde_json::json;
    use uuid::Uuid;

    fn config() -> CloudTasksConfig {
        CloudTasksConfig {
            project_id: "proj".to_string(),
            location: "us-central1".to_string(),
            queue_name: "jobs".to_string(),
            service_url: "https://relay.example.run.app/".to_string(),
            service_account_email: "invoker@proj.iam.gserviceaccount.com".to_string(),
            audience: None,
            dispatch_deadline: Duration::from_secs(900),
        }
    }

    #[test]
    fn test_create_task_request_shape() {
        let queue = CloudTasksQueue::new(config()).unwrap();
        let task = ExecuteTask {
            job_id: Uuid::nil(),
            params: JobParams::from(json!({"query": "A"})),
        };

        let request = serde_json::to_value(queue.build_request(&task).unwrap()).unwrap();
        let http = &request["task"]["httpRequest"];
        assert_eq!(
            request["task"]["name"],
            "projects/proj/locations/us-central1/queues/jobs/tasks/job-00000000000000000000000000000000"
        );
        assert_eq!(http["url"], "https://relay.example.run.app/_internal/execute");
        assert_eq!(http["httpMethod"], "POST");
        assert_eq!(http["oidcToken"]["audience"], "https://relay.example.run.app");
        assert_eq!(request["task"]["dispatchDeadline"], "900s");

        let body = base64::engine::general_purpose::STANDARD
            .decode(http["body"].as_str().unwrap())
            .unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            decoded,
            json!({"jobId": "00000000-0000-0000-0000-000000000000", "query": "A"})
        );
    }

    #[test]
    fn test_task_name_is_stable_per_job() {
        let config = config();
        let id = Uuid::new_v4();
        let a = ExecuteTask {
            job_id: id,
            params: JobParams::from(json!({"q": 1})),
        };
        let b = ExecuteTask {
            job_id: id,
            params: JobParams::from(json!({"q": 2})),
        };
        assert_eq!(config.task_name(&a), config.task_name(&b));
    }
}
