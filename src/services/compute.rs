use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::models::job::JobResult;
use crate::models::task::JobParams;

/// The external worker that turns job parameters into an artifact.
#[async_trait]
pub trait ComputeEngine: Send + Sync {
    /// One attempt. Cancellation (dropping the future) must stop the work.
    async fn run(
        &self,
        job_id: Uuid,
        params: &JobParams,
        output_dir: &Path,
    ) -> Result<JobResult, ComputeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("compute failed: {0}")]
    Failure(String),

    #[error("compute timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Runs the engine as a child process.
///
/// Parameters are written to stdin as JSON; the child gets
/// `--job-id <id> --output-dir <dir>` after any configured arguments and must
/// print its result descriptor as the last line of stdout.
pub struct ProcessComputeEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessComputeEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl ComputeEngine for ProcessComputeEngine {
    async fn run(
        &self,
        job_id: Uuid,
        params: &JobParams,
        output_dir: &Path,
    ) -> Result<JobResult, ComputeError> {
        let input = serde_json::to_vec(params)
            .map_err(|e| ComputeError::Failure(format!("encode parameters: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--job-id")
            .arg(job_id.to_string())
            .arg("--output-dir")
            .arg(output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ComputeError::Failure(format!("spawn {}: {e}", self.program.display()))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that exits without reading stdin closes the pipe; its
            // exit status is what matters.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(job_id = %job_id, error = %e, "Compute engine closed stdin early");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ComputeError::Failure(format!("wait for compute engine: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = last_line(&stderr).unwrap_or("no diagnostic output");
            return Err(ComputeError::Failure(format!(
                "engine exited with {}: {detail}",
                output.status
            )));
        }

        parse_descriptor(&String::from_utf8_lossy(&output.stdout))
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|line| !line.is_empty())
}

/// Parse the result descriptor from the engine's stdout: the last non-empty
/// line, a JSON object with a non-empty `artifact`.
pub fn parse_descriptor(stdout: &str) -> Result<JobResult, ComputeError> {
    let line = last_line(stdout)
        .ok_or_else(|| ComputeError::Failure("engine produced no output".to_string()))?;

    let value: Value = serde_json::from_str(line)
        .map_err(|e| ComputeError::Failure(format!("malformed engine output: {e}")))?;
    let result: JobResult = serde_json::from_value(value)
        .map_err(|e| ComputeError::Failure(format!("malformed result descriptor: {e}")))?;

    if result.artifact.trim().is_empty() {
        return Err(ComputeError::Failure(
            "result descriptor has an empty artifact".to_string(),
        ));
    }
    Ok(result)
}
