use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::job::JobStatus;

/// Upper bound on the encoded size of submitted parameters.
pub const MAX_PARAMS_BYTES: usize = 64 * 1024;

/// Envelope key the execute task carries next to the parameters.
pub const RESERVED_PARAM_KEY: &str = "jobId";

/// Opaque job parameters, forwarded verbatim to the compute engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(transparent)]
pub struct JobParams(#[garde(custom(validate_params))] pub Map<String, Value>);

fn validate_params(value: &Map<String, Value>, _context: &()) -> garde::Result {
    if value.is_empty() {
        return Err(garde::Error::new("parameters must not be empty"));
    }
    if value.contains_key(RESERVED_PARAM_KEY) {
        return Err(garde::Error::new(format!(
            "parameter name '{RESERVED_PARAM_KEY}' is reserved"
        )));
    }
    let encoded = serde_json::to_vec(value).map_or(usize::MAX, |bytes| bytes.len());
    if encoded > MAX_PARAMS_BYTES {
        return Err(garde::Error::new(format!(
            "parameters exceed {MAX_PARAMS_BYTES} bytes"
        )));
    }
    Ok(())
}

impl JobParams {
    /// Deterministic dedup key: SHA-256 over the canonical JSON encoding.
    ///
    /// `serde_json::Map` keeps keys sorted, so logically equal parameter sets
    /// encode identically regardless of submission order.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(&self.0).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }
}

impl From<Value> for JobParams {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

/// Payload delivered to `POST /_internal/execute`: `{jobId, ...params}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTask {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub params: JobParams,
}

/// Response for `POST /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cached: bool,
}

/// Response for `POST /_internal/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub job_id: Uuid,
    pub outcome: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
