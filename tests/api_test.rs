mod helpers;

use axum::http::{Method, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use helpers::{
    build_state, eventually, mint_token, send, test_config, test_router, valid_token,
    MemoryDocumentStore, ScriptedEngine, Step, TEST_AUDIENCE,
};
use jobrelay::db::DocumentStore;
use jobrelay::models::job::JobStatus;

#[tokio::test]
async fn submit_runs_job_and_dedups_resubmission() {
    let config = test_config(&[]);
    let engine = ScriptedEngine::always("out/render.png");
    let state = build_state(&config, None, engine.clone());
    let router = test_router(&state);

    let (status, body) = send(
        &router,
        Method::POST,
        "/jobs",
        None,
        Some(json!({"query": "tiles", "zoom": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["cached"], false);
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let uri = format!("/jobs/{job_id}");
    let (r, u) = (&router, uri.as_str());
    let done = eventually(Duration::from_secs(5), || async move {
        let (_, job) = send(r, Method::GET, u, None, None).await;
        job["status"] == "completed"
    })
    .await;
    assert!(done, "job never completed");

    let (_, job) = send(&router, Method::GET, &uri, None, None).await;
    assert_eq!(job["progress"], 100);
    assert_eq!(job["result"]["artifact"], "out/render.png");
    assert!(job.get("error").is_none());

    // Same parameters in a different key order hit the cache.
    let (status, again) = send(
        &router,
        Method::POST,
        "/jobs",
        None,
        Some(json!({"zoom": 3, "query": "tiles"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(again["cached"], true);
    assert_eq!(again["status"], "completed");
    assert_ne!(again["jobId"], body["jobId"]);
    assert_eq!(engine.calls(), 1);

    let (_, cached_job) = send(
        &router,
        Method::GET,
        &format!("/jobs/{}", again["jobId"].as_str().unwrap()),
        None,
        None,
    )
    .await;
    assert_eq!(cached_job["result"]["artifact"], "out/render.png");
}

#[tokio::test]
async fn submit_rejects_invalid_params() {
    let config = test_config(&[]);
    let state = build_state(&config, None, ScriptedEngine::always("x"));
    let router = test_router(&state);

    let (status, body) = send(&router, Method::POST, "/jobs", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid parameters"));

    let (status, _) = send(&router, Method::POST, "/jobs", None, Some(json!([1, 2]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // `jobId` belongs to the task envelope; letting it through would produce
    // a delivery body the webhook cannot parse.
    let (status, body) = send(
        &router,
        Method::POST,
        "/jobs",
        None,
        Some(json!({"jobId": Uuid::new_v4(), "query": "A"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("reserved"));
}

#[tokio::test]
async fn get_unknown_job_is_404() {
    let config = test_config(&[]);
    let state = build_state(&config, None, ScriptedEngine::always("x"));
    let router = test_router(&state);

    let (status, _) = send(
        &router,
        Method::GET,
        &format!("/jobs/{}", Uuid::new_v4()),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_signature_is_rejected_and_job_stays_queued() {
    let config = test_config(&[]);
    let engine = ScriptedEngine::always("x");
    let state = build_state(&config, None, engine.clone());
    let router = test_router(&state);

    let job_id = Uuid::new_v4();
    state.jobs.create(job_id).await;
    let task = json!({"jobId": job_id, "query": "tiles"});

    let forged = mint_token("not-the-secret", TEST_AUDIENCE);
    let (status, body) = send(
        &router,
        Method::POST,
        "/_internal/execute",
        Some(&forged),
        Some(task.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = send(&router, Method::POST, "/_internal/execute", None, Some(task)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let job = state.jobs.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0);
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn execute_is_idempotent_on_redelivery() {
    let config = test_config(&[]);
    let engine = ScriptedEngine::new(vec![Step::Succeed("out/first.bin")], "out/second.bin");
    let state = build_state(&config, None, engine.clone());
    let router = test_router(&state);
    let token = valid_token();

    // No job record yet: the coordinator creates one.
    let job_id = Uuid::new_v4();
    let task = json!({"jobId": job_id, "query": "tiles"});

    let (status, body) = send(
        &router,
        Method::POST,
        "/_internal/execute",
        Some(&token),
        Some(task.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "completed");

    let (status, body) = send(
        &router,
        Method::POST,
        "/_internal/execute",
        Some(&token),
        Some(task),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "completed");
    assert_eq!(body["retryable"], false);

    let job = state.jobs.get(job_id).await.unwrap();
    assert_eq!(job.result.unwrap().artifact, "out/first.bin");
    assert_eq!(engine.calls(), 1);
}

#[tokio::test]
async fn execute_rejects_malformed_body() {
    let config = test_config(&[]);
    let state = build_state(&config, None, ScriptedEngine::always("x"));
    let router = test_router(&state);

    let (status, _) = send(
        &router,
        Method::POST,
        "/_internal/execute",
        Some(&valid_token()),
        Some(json!({"query": "no job id"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn exhausted_compute_fails_job_with_retryable_500() {
    let config = test_config(&[("COMPUTE_MAX_ATTEMPTS", "3")]);
    let engine = ScriptedEngine::new(
        vec![
            Step::Fail("segfault"),
            Step::Fail("segfault"),
            Step::Fail("segfault\u{7}"),
        ],
        "never",
    );
    let state = build_state(&config, None, engine.clone());
    let router = test_router(&state);

    let job_id = Uuid::new_v4();
    state.jobs.create(job_id).await;
    let (status, body) = send(
        &router,
        Method::POST,
        "/_internal/execute",
        Some(&valid_token()),
        Some(json!({"jobId": job_id, "query": "tiles"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["retryable"], true);
    assert_eq!(engine.calls(), 3);

    let job = state.jobs.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert!(error.contains("after 3 attempts"));
    assert!(!error.chars().any(char::is_control));
    assert!(job.result.is_none());
}

#[tokio::test]
async fn missing_output_location_is_not_retryable() {
    let missing = std::env::temp_dir().join(format!("jobrelay-absent-{}", Uuid::new_v4()));
    let config = test_config(&[("OUTPUT_DIR", missing.to_str().unwrap())]);
    let engine = ScriptedEngine::always("x");
    let state = build_state(&config, None, engine.clone());
    let router = test_router(&state);

    let job_id = Uuid::new_v4();
    let (status, body) = send(
        &router,
        Method::POST,
        "/_internal/execute",
        Some(&valid_token()),
        Some(json!({"jobId": job_id, "query": "tiles"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["retryable"], false);
    assert_eq!(engine.calls(), 0);
    assert_eq!(
        state.jobs.get(job_id).await.unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn concurrent_delivery_is_deferred() {
    let config = test_config(&[]);
    let engine = ScriptedEngine::always("x");
    let state = build_state(&config, None, engine.clone());
    let router = test_router(&state);

    let job_id = Uuid::new_v4();
    state.jobs.create(job_id).await;
    state
        .jobs
        .update_status(job_id, JobStatus::Processing, Some(40))
        .await;

    let (status, body) = send(
        &router,
        Method::POST,
        "/_internal/execute",
        Some(&valid_token()),
        Some(json!({"jobId": job_id, "query": "tiles"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["outcome"], "in_flight");
    assert_eq!(engine.calls(), 0);
    assert_eq!(state.jobs.get(job_id).await.unwrap().progress, 40);
}

#[tokio::test]
async fn storage_status_reports_breaker_and_quotas() {
    let config = test_config(&[("QUOTA_DAILY_WRITES", "100")]);
    let store = MemoryDocumentStore::new();
    let documents: Arc<dyn DocumentStore> = store.clone();
    let state = build_state(&config, Some(documents), ScriptedEngine::always("x"));
    let router = test_router(&state);

    let (status, body) = send(&router, Method::GET, "/_internal/storage-status", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["circuitBreaker"]["status"], "closed");
    assert!(body["circuitBreaker"].get("blockedOperation").is_none());
    assert_eq!(body["quotas"]["writes"]["limit"], 100);
    assert!(body["quotas"]["storage"]["limitBytes"].as_u64().unwrap() > 0);

    state
        .quota
        .set_usage(jobrelay::models::quota::QuotaCounter::Writes, 96);
    send(&router, Method::POST, "/jobs", None, Some(json!({"query": "a"}))).await;

    let (_, body) = send(&router, Method::GET, "/_internal/storage-status", None, None).await;
    assert_eq!(body["circuitBreaker"]["status"], "open");
    assert_eq!(body["circuitBreaker"]["blockedOperation"], "writes");
    assert_eq!(body["quotas"]["writes"]["percentage"], 96.0);
}

#[tokio::test]
async fn store_outage_never_surfaces_as_5xx() {
    let config = test_config(&[]);
    let store = MemoryDocumentStore::new();
    let documents: Arc<dyn DocumentStore> = store.clone();
    let state = build_state(&config, Some(documents), ScriptedEngine::always("out/a.bin"));
    let router = test_router(&state);

    store.set_failing(true);

    let (status, body) = send(&router, Method::POST, "/jobs", None, Some(json!({"query": "a"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let uri = format!("/jobs/{}", body["jobId"].as_str().unwrap());

    let (r, u) = (&router, uri.as_str());
    let done = eventually(Duration::from_secs(5), || async move {
        let (status, job) = send(r, Method::GET, u, None, None).await;
        assert!(!status.is_server_error());
        job["status"] == "completed"
    })
    .await;
    assert!(done);
    assert_eq!(store.job_count(), 0);

    let (status, _) = send(
        &router,
        Method::GET,
        &format!("/jobs/{}", Uuid::new_v4()),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, health) = send(&router, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["checks"]["durable_store"]["status"], "error");
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let config = test_config(&[]);
    let state = build_state(&config, None, ScriptedEngine::always("x"));
    let router = test_router(&state);

    let (status, health) = send(&router, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["checks"]["durable_store"]["status"], "disabled");
    assert_eq!(health["checks"]["circuit_breaker"], "closed");

    let (status, _) = send(&router, Method::GET, "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
}
