//! Shared fakes and builders for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use jobrelay::app_state::AppState;
use jobrelay::config::AppConfig;
use jobrelay::db::{DocumentStore, RecordKey, StoreError, StoredRecord};
use jobrelay::models::cache::CacheEntry;
use jobrelay::models::job::{Job, JobResult};
use jobrelay::models::quota::QuotaSnapshot;
use jobrelay::models::task::JobParams;
use jobrelay::routes;
use jobrelay::services::compute::{ComputeEngine, ComputeError};
use jobrelay::services::quota::QuotaMonitor;

pub const TEST_ISSUER: &str = "https://issuer.test";
pub const TEST_AUDIENCE: &str = "https://relay.test";
pub const TEST_SECRET: &str = "integration-secret";

/// In-memory `DocumentStore` with a failure switch and call counters.
#[derive(Default)]
pub struct MemoryDocumentStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    quota: Mutex<Option<QuotaSnapshot>>,
    failing: AtomicBool,
    failing_reads: AtomicBool,
    pub job_writes: AtomicU32,
    pub cache_writes: AtomicU32,
    /// Storage usage seen at each delete, when observing.
    observer: Mutex<Option<Arc<QuotaMonitor>>>,
    pub observed_storage: Mutex<Vec<u64>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail only point reads, as a flaky read path would.
    pub fn set_failing_reads(&self, failing: bool) {
        self.failing_reads.store(failing, Ordering::SeqCst);
    }

    pub fn observe_storage(&self, quota: Arc<QuotaMonitor>) {
        *self.observer.lock().unwrap() = Some(quota);
    }

    pub fn seed_job(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn seed_cache_entry(&self, entry: CacheEntry) {
        self.cache
            .lock()
            .unwrap()
            .insert(entry.fingerprint.clone(), entry);
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn cache_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn saved_quota(&self) -> Option<QuotaSnapshot> {
        self.quota.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), StoreError> {
        self.check()?;
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }

    fn observe(&self) {
        if let Some(quota) = self.observer.lock().unwrap().as_ref() {
            self.observed_storage
                .lock()
                .unwrap()
                .push(quota.usage().storage_bytes);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.check_read()?;
        Ok(self.job(id))
    }

    async fn insert_job(&self, job: &Job) -> Result<bool, StoreError> {
        self.check()?;
        self.job_writes.fetch_add(1, Ordering::SeqCst);
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn put_job(&self, job: &Job) -> Result<bool, StoreError> {
        self.check()?;
        self.job_writes.fetch_add(1, Ordering::SeqCst);
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.get(&job.id).is_some_and(Job::is_terminal) {
            return Ok(false);
        }
        jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        self.observe();
        Ok(self.jobs.lock().unwrap().remove(&id).is_some())
    }

    async fn stale_jobs(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        self.check()?;
        let mut stale: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|job| job.created_at);
        Ok(stale
            .into_iter()
            .take(limit)
            .map(|job| StoredRecord {
                key: RecordKey::Job(job.id),
                size_bytes: job.size_bytes(),
                timestamp: job.created_at,
            })
            .collect())
    }

    async fn get_cache_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.check_read()?;
        Ok(self.cache.lock().unwrap().get(fingerprint).cloned())
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.check()?;
        self.cache_writes.fetch_add(1, Ordering::SeqCst);
        self.seed_cache_entry(entry.clone());
        Ok(())
    }

    async fn delete_cache_entry(&self, fingerprint: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.observe();
        Ok(self.cache.lock().unwrap().remove(fingerprint).is_some())
    }

    async fn expired_cache_entries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        self.check()?;
        let mut expired: Vec<CacheEntry> = self
            .cache
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|entry| entry.expires_at);
        Ok(expired
            .into_iter()
            .take(limit)
            .map(|entry| StoredRecord {
                size_bytes: entry.size_bytes(),
                timestamp: entry.expires_at,
                key: RecordKey::Cache(entry.fingerprint),
            })
            .collect())
    }

    async fn load_quota(&self) -> Result<Option<QuotaSnapshot>, StoreError> {
        self.check()?;
        Ok(self.saved_quota())
    }

    async fn save_quota(&self, snapshot: &QuotaSnapshot) -> Result<(), StoreError> {
        self.check()?;
        *self.quota.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    /// Outlast any attempt timeout.
    Hang,
    Fail(&'static str),
    Succeed(&'static str),
}

/// Compute engine that plays back a script, then succeeds with `default`.
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Step>>,
    default: String,
    pub calls: AtomicU32,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Step>, default: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default: default.to_string(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn always(artifact: &str) -> Arc<Self> {
        Self::new(Vec::new(), artifact)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeEngine for ScriptedEngine {
    async fn run(
        &self,
        _job_id: Uuid,
        _params: &JobParams,
        _output_dir: &Path,
    ) -> Result<JobResult, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ComputeError::Failure("hang ended".to_string()))
            }
            Some(Step::Fail(message)) => Err(ComputeError::Failure(message.to_string())),
            Some(Step::Succeed(artifact)) => Ok(JobResult::new(artifact)),
            None => Ok(JobResult::new(self.default.clone())),
        }
    }
}

pub fn mint_token(secret: &str, audience: &str) -> String {
    let exp = Utc::now().timestamp() + 600;
    encode(
        &Header::new(Algorithm::HS256),
        &json!({
            "iss": TEST_ISSUER,
            "aud": audience,
            "exp": exp,
            "sub": "cloud-tasks",
            "email": "tasks@test.iam.gserviceaccount.com",
        }),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

pub fn valid_token() -> String {
    mint_token(TEST_SECRET, TEST_AUDIENCE)
}

/// Local-mode config with HS256 webhook auth and `extra` overrides.
pub fn test_config(extra: &[(&str, &str)]) -> AppConfig {
    let output_dir = std::env::temp_dir();
    let mut vars: HashMap<String, String> = [
        ("AUTH_ISSUER", TEST_ISSUER),
        ("AUTH_AUDIENCE", TEST_AUDIENCE),
        ("AUTH_HS256_SECRET", TEST_SECRET),
        ("COMPUTE_RETRY_DELAY_SECS", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert(
        "OUTPUT_DIR".to_string(),
        output_dir.to_string_lossy().into_owned(),
    );
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }

    let config: AppConfig = envy::from_iter(vars).expect("test config");
    config.validate().expect("valid test config");
    config
}

pub fn build_state(
    config: &AppConfig,
    documents: Option<Arc<dyn DocumentStore>>,
    engine: Arc<dyn ComputeEngine>,
) -> AppState {
    let quota = Arc::new(QuotaMonitor::new(config.quota_limits()));
    AppState::build(config, documents, quota, engine).expect("app state")
}

pub fn test_router(state: &AppState) -> Router {
    let handle = PrometheusBuilder::new().build_recorder().handle();
    routes::router(state.clone(), Arc::new(handle))
}

/// Send one request through the router and parse the JSON reply.
pub async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(payload) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&payload).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Poll until `check` passes or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
