use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for the service's metrics.
pub fn describe() {
    metrics::describe_counter!("jobs_submitted_total", "Jobs accepted and handed to the task queue");
    metrics::describe_counter!("jobs_completed_total", "Jobs that reached completed");
    metrics::describe_counter!("jobs_failed_total", "Jobs that reached failed");
    metrics::describe_counter!("cache_hits_total", "Submissions answered from the result cache");
    metrics::describe_histogram!(
        "compute_duration_seconds",
        "Wall clock of one bridge execution including retries"
    );
    metrics::describe_counter!(
        "circuit_breaker_blocked_total",
        "Durable store calls redirected to transient storage"
    );
    metrics::describe_counter!("cleanup_deleted_total", "Records removed by the cleanup sweeper");
}

/// GET /metrics: Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
