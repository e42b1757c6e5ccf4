use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::Job;
use crate::models::task::{JobParams, SubmitReceipt};
use crate::services::dispatcher::DispatchError;

type ApiError = (StatusCode, Json<Value>);

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    let message: String = message.into();
    (status, Json(json!({ "error": message })))
}

/// POST /jobs: accept a work request; compute runs asynchronously.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ApiError> {
    match state.dispatcher.submit(JobParams::from(body)).await {
        Ok(receipt) => Ok((StatusCode::ACCEPTED, Json(receipt))),
        Err(e @ DispatchError::InvalidParams(_)) => {
            Err(error_body(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(DispatchError::Queue(_)) => Err(error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "job could not be scheduled, try again later",
        )),
    }
}

/// GET /jobs/{id}: current job record. Storage trouble degrades to the
/// transient copy, never to a 5xx.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state
        .jobs
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "job not found"))
}
