use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Maximum length of a user-visible job error message.
pub const MAX_ERROR_LEN: usize = 500;

/// Progress recorded when the coordinator picks a job up.
pub const PROCESSING_STARTED_PROGRESS: u8 = 10;

/// Status of a job in the async pipeline.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs absorb every further write.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }

    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

/// Result descriptor produced by the compute engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Reference to the generated artifact (path or URL).
    pub artifact: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl JobResult {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// A unit of requested asynchronous work and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a job store mutation.
///
/// Mutators never raise: an unknown id or a write against a terminal job is
/// reported here and logged by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Applied,
    NotFound,
    AlreadyExists,
    Terminal,
    InvalidTransition,
}

impl StoreOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl Job {
    /// A freshly dispatched job.
    pub fn queued(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A job that was satisfied from the result cache at submission time.
    pub fn completed(id: Uuid, result: JobResult) -> Self {
        let mut job = Self::queued(id);
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.result = Some(result);
        job
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Serialized size used for storage accounting.
    pub fn size_bytes(&self) -> u64 {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len() as u64)
    }

    /// Moves a non-terminal job forward. Terminal targets go through
    /// [`Job::apply_complete`] / [`Job::apply_fail`].
    pub fn apply_status(
        &mut self,
        status: JobStatus,
        progress: Option<u8>,
        now: DateTime<Utc>,
    ) -> StoreOutcome {
        if self.is_terminal() {
            return StoreOutcome::Terminal;
        }
        if status.is_terminal() || status.rank() < self.status.rank() {
            return StoreOutcome::InvalidTransition;
        }

        let progress = progress.map_or(self.progress, |p| p.min(100));
        self.progress = self.progress.max(progress);
        self.status = status;
        self.updated_at = now;
        StoreOutcome::Applied
    }

    pub fn apply_complete(&mut self, result: JobResult, now: DateTime<Utc>) -> StoreOutcome {
        if self.is_terminal() {
            return StoreOutcome::Terminal;
        }
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.updated_at = now;
        StoreOutcome::Applied
    }

    pub fn apply_fail(&mut self, error: &str, now: DateTime<Utc>) -> StoreOutcome {
        if self.is_terminal() {
            return StoreOutcome::Terminal;
        }
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(sanitize_error(error));
        self.updated_at = now;
        StoreOutcome::Applied
    }

    /// Ordering used to reconcile two copies of the same job held by
    /// different backends: later lifecycle stage wins, then later update.
    pub fn freshness(&self) -> (u8, DateTime<Utc>) {
        (self.status.rank(), self.updated_at)
    }
}

/// Picks the most advanced of two copies of a job.
pub fn freshest(a: Option<Job>, b: Option<Job>) -> Option<Job> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.freshness() > a.freshness() { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Strips control characters and bounds the message length.
pub fn sanitize_error(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= MAX_ERROR_LEN {
        return cleaned.to_string();
    }
    let mut truncated: String = cleaned.chars().take(MAX_ERROR_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}
