//! Verification of the OIDC identity Cloud Tasks attaches to each delivery.
//!
//! Tokens are checked for signature, issuer, audience and expiry. Signatures
//! are verified against Google's JWKS (RS256/ES256) or, for local stacks and
//! tests, a shared HS256 secret.

use axum::http::HeaderMap;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";
pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TaskAuthConfig {
    pub issuer: String,
    pub audience: String,
    /// Shared secret; when set, tokens are HS256 and JWKS is not consulted.
    pub hs256_secret: Option<String>,
    pub jwks_url: String,
    /// Only tokens minted for this service account are accepted.
    pub allowed_email: Option<String>,
}

impl TaskAuthConfig {
    pub fn google(audience: impl Into<String>, allowed_email: Option<String>) -> Self {
        Self {
            issuer: GOOGLE_ISSUER.to_string(),
            audience: audience.into(),
            hs256_secret: None,
            jwks_url: GOOGLE_JWKS_URL.to_string(),
            allowed_email,
        }
    }

    pub fn hs256(issuer: impl Into<String>, audience: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            hs256_secret: Some(secret.into()),
            jwks_url: GOOGLE_JWKS_URL.to_string(),
            allowed_email: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token principal {0:?} is not allowed")]
    PrincipalNotAllowed(Option<String>),

    #[error("jwks refresh failed: {0}")]
    Jwks(String),
}

/// Identity carried by a verified delivery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskPrincipal {
    pub sub: Option<String>,
    pub email: Option<String>,
}

struct CachedJwks {
    set: Arc<JwkSet>,
    fetched_at: Instant,
}

pub struct TaskVerifier {
    config: TaskAuthConfig,
    jwks: RwLock<Option<CachedJwks>>,
    http: reqwest::Client,
}

impl TaskVerifier {
    pub fn new(config: TaskAuthConfig) -> Self {
        Self {
            config,
            jwks: RwLock::new(None),
            http: reqwest::Client::new(),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<TaskPrincipal, AuthError> {
        let principal = match self.config.hs256_secret.as_deref() {
            Some(secret) => self.decode_hs256(token, secret)?,
            None => self.decode_with_jwks(token).await?,
        };

        if let Some(allowed) = self.config.allowed_email.as_deref() {
            if principal.email.as_deref() != Some(allowed) {
                return Err(AuthError::PrincipalNotAllowed(principal.email));
            }
        }
        Ok(principal)
    }

    fn decode_hs256(&self, token: &str, secret: &str) -> Result<TaskPrincipal, AuthError> {
        decode::<TaskPrincipal>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &self.validation(Algorithm::HS256),
        )
        .map(|data| data.claims)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    async fn decode_with_jwks(&self, token: &str) -> Result<TaskPrincipal, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("missing kid".to_string()))?;
        let algorithm = match header.alg {
            Algorithm::RS256 | Algorithm::ES256 => header.alg,
            other => {
                return Err(AuthError::InvalidToken(format!(
                    "unsupported algorithm: {other:?}"
                )))
            }
        };

        let jwk = self
            .jwk(&kid)
            .await?
            .ok_or_else(|| AuthError::InvalidToken("unknown kid".to_string()))?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AuthError::InvalidToken(format!("invalid jwk: {e}")))?;

        decode::<TaskPrincipal>(token, &key, &self.validation(algorithm))
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation
    }

    async fn jwk(&self, kid: &str) -> Result<Option<Jwk>, AuthError> {
        if let Some(jwk) = self.cached_jwk(kid).await {
            return Ok(Some(jwk));
        }
        self.refresh_jwks().await?;
        Ok(self.cached_jwk(kid).await)
    }

    async fn cached_jwk(&self, kid: &str) -> Option<Jwk> {
        let cache = self.jwks.read().await;
        let set = match cache.as_ref() {
            Some(cached) if cached.fetched_at.elapsed() < JWKS_CACHE_TTL => Arc::clone(&cached.set),
            _ => return None,
        };
        drop(cache);

        set.keys
            .iter()
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
            .cloned()
    }

    async fn refresh_jwks(&self) -> Result<(), AuthError> {
        let set = self
            .http
            .get(&self.config.jwks_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?
            .error_for_status()
            .map_err(|e| AuthError::Jwks(e.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?;

        *self.jwks.write().await = Some(CachedJwks {
            set: Arc::new(set),
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

/// Gate in front of the execute webhook.
pub enum TaskAuthenticator {
    Verify(TaskVerifier),
    /// Local mode with `SKIP_AUTH=true`.
    Disabled,
}

impl TaskAuthenticator {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Verify(_))
    }

    /// Verify the bearer token in `headers`. `Ok(None)` when auth is disabled.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<TaskPrincipal>, AuthError> {
        match self {
            Self::Disabled => Ok(None),
            Self::Verify(verifier) => {
                let token = extract_bearer_token(headers).ok_or(AuthError::MissingToken)?;
                verifier.verify(token).await.map(Some)
            }
        }
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
