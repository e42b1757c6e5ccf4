//! Process bridge: bounded retries and a hard per-attempt timeout around the
//! compute engine.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::job::JobResult;
use crate::models::task::JobParams;
use crate::services::compute::{ComputeEngine, ComputeError};

/// Fixed-delay retry policy for compute attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Worst-case wall clock for one full run of the policy.
    pub fn budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        self.attempt_timeout * attempts + self.delay * (attempts - 1)
    }

    /// Run `attempt` until it succeeds or the attempts are used up. Each
    /// attempt gets its 1-based number and is dropped when it overruns
    /// `attempt_timeout`.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, BridgeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ComputeError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut number = 1;
        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, attempt(number)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ComputeError::Timeout(self.attempt_timeout)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if number >= attempts => {
                    return Err(BridgeError::Exhausted {
                        attempts: number,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(
                        attempt = number,
                        max_attempts = attempts,
                        error = %e,
                        "Compute attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    number += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("output location {} does not exist or is not a directory", .0.display())]
    OutputLocationMissing(PathBuf),

    #[error("{last} (after {attempts} attempts)")]
    Exhausted { attempts: u32, last: ComputeError },
}

impl BridgeError {
    /// Whether the queue should redeliver the task.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

pub struct ProcessBridge {
    engine: Arc<dyn ComputeEngine>,
    policy: RetryPolicy,
    output_dir: PathBuf,
}

impl ProcessBridge {
    pub fn new(engine: Arc<dyn ComputeEngine>, policy: RetryPolicy, output_dir: PathBuf) -> Self {
        Self {
            engine,
            policy,
            output_dir,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the engine for `job_id` under the retry policy.
    pub async fn execute(&self, job_id: Uuid, params: &JobParams) -> Result<JobResult, BridgeError> {
        let output_dir_ok = tokio::fs::metadata(&self.output_dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !output_dir_ok {
            return Err(BridgeError::OutputLocationMissing(self.output_dir.clone()));
        }

        let started = Instant::now();
        let result = self
            .policy
            .run(|attempt| {
                info!(job_id = %job_id, attempt, "Invoking compute engine");
                self.engine.run(job_id, params, &self.output_dir)
            })
            .await;
        metrics::histogram!("compute_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_millis(50),
        }
    }

    /// Hangs for the first `hangs` attempts, then succeeds.
    struct SlowStart {
        hangs: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ComputeEngine for SlowStart {
        async fn run(&self, _: Uuid, _: &JobParams, _: &Path) -> Result<JobResult, ComputeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.hangs {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(JobResult::new(format!("out/{call}.bin")))
        }
    }

    #[test]
    fn test_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.budget(), Duration::from_secs(3 * 300 + 2 * 5));
    }

    #[tokio::test]
    async fn test_policy_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(ComputeError::Failure("crash".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_policy_exhaustion_reports_attempts() {
        let err = fast_policy()
            .run(|_| async { Err::<(), _>(ComputeError::Failure("crash".to_string())) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::Exhausted {
                attempts: 3,
                last: ComputeError::Failure("crash".to_string()),
            }
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_bridge_times_out_then_succeeds() {
        let engine = Arc::new(SlowStart {
            hangs: 2,
            calls: AtomicU32::new(0),
        });
        let bridge = ProcessBridge::new(engine.clone(), fast_policy(), std::env::temp_dir());
        let result = bridge
            .execute(Uuid::new_v4(), &JobParams::from(json!({"q": 1})))
            .await
            .unwrap();
        assert_eq!(result.artifact, "out/3.bin");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_output_dir_fails_fast() {
        let engine = Arc::new(SlowStart {
            hangs: 0,
            calls: AtomicU32::new(0),
        });
        let missing = std::env::temp_dir().join(format!("jobrelay-missing-{}", Uuid::new_v4()));
        let bridge = ProcessBridge::new(engine.clone(), fast_policy(), missing.clone());
        let err = bridge
            .execute(Uuid::new_v4(), &JobParams::from(json!({"q": 1})))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::OutputLocationMissing(missing));
        assert!(!err.is_retryable());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }
}
