use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::app_state::AppState;
use crate::models::quota::StorageStatus;
use crate::models::task::{ExecuteResponse, ExecuteTask};
use crate::services::coordinator::ExecutionOutcome;

/// Status code returned to the queue for each execution outcome. Cloud Tasks
/// redelivers on any non-2xx, so only retryable failures map to 5xx.
pub fn execution_status(outcome: &ExecutionOutcome) -> StatusCode {
    match outcome {
        ExecutionOutcome::Completed(_) | ExecutionOutcome::AlreadyTerminal(_) => StatusCode::OK,
        ExecutionOutcome::InFlight => StatusCode::SERVICE_UNAVAILABLE,
        ExecutionOutcome::Failed { retryable: true, .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ExecutionOutcome::Failed { retryable: false, .. } => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// POST /_internal/execute: queue delivery of one job.
pub async fn execute_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = state.auth.authenticate(&headers).await {
        warn!(security_event = "task_auth_rejected", error = %e, "Rejected execute delivery");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    let task: ExecuteTask = match serde_json::from_slice(&body) {
        Ok(task) => task,
        Err(e) => {
            warn!(error = %e, "Malformed execute payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("malformed task: {e}") })),
            )
                .into_response();
        }
    };

    let job_id = task.job_id;
    let outcome = state.coordinator.execute(task).await;
    let status = execution_status(&outcome);

    let response = match outcome {
        ExecutionOutcome::Completed(_) => ExecuteResponse {
            job_id,
            outcome: "completed".to_string(),
            retryable: false,
            error: None,
        },
        ExecutionOutcome::AlreadyTerminal(status) => ExecuteResponse {
            job_id,
            outcome: status.to_string(),
            retryable: false,
            error: None,
        },
        ExecutionOutcome::InFlight => ExecuteResponse {
            job_id,
            outcome: "in_flight".to_string(),
            retryable: true,
            error: None,
        },
        ExecutionOutcome::Failed { error, retryable } => ExecuteResponse {
            job_id,
            outcome: "failed".to_string(),
            retryable,
            error: Some(error),
        },
    };

    (status, Json(response)).into_response()
}

/// GET /_internal/storage-status: breaker state and quota usage.
pub async fn storage_status(State(state): State<AppState>) -> Json<StorageStatus> {
    Json(state.storage_status())
}
