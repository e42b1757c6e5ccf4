use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::circuit_breaker::BreakerState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub durable_store: ComponentHealth,
    pub circuit_breaker: BreakerState,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /health: dependency status.
///
/// Always 200: with the durable store down or the breaker open, requests are
/// still served from transient storage, so the instance reports `degraded`.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let start = std::time::Instant::now();

    let store_check = match &state.documents {
        None => ComponentHealth {
            status: "disabled".to_string(),
            latency_ms: None,
        },
        Some(store) => match store.ping().await {
            Ok(()) => ComponentHealth {
                status: "ok".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Durable store health check failed");
                ComponentHealth {
                    status: "error".to_string(),
                    latency_ms: None,
                }
            }
        },
    };

    let breaker = state.breaker.state();
    let healthy = store_check.status != "error" && breaker == BreakerState::Closed;

    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            durable_store: store_check,
            circuit_breaker: breaker,
        },
    })
}
