//! Bearer token → project resolution.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use pulse_core::ProjectId;

use crate::api_key::{ApiKey, KeyStatus, hash_api_key};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization")]
    Missing,

    #[error("invalid authorization format")]
    Malformed,

    #[error("invalid API key")]
    Invalid,

    #[error("API key expired")]
    Expired,

    /// The key store could not be consulted. Not a credential problem.
    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Stable machine-readable code used in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing_authorization",
            AuthError::Malformed => "invalid_authorization_format",
            AuthError::Invalid => "invalid_api_key",
            AuthError::Expired => "api_key_expired",
            AuthError::Unavailable(_) => "auth_unavailable",
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.map(str::trim).filter(|h| !h.is_empty()).ok_or(AuthError::Missing)?;
    match header.split_once(' ') {
        Some(("Bearer", token)) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::Malformed),
    }
}

/// Resolves a bearer token to the project it authenticates.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<ProjectId, AuthError>;
}

#[async_trait]
impl<P> AuthProvider for Arc<P>
where
    P: AuthProvider + ?Sized,
{
    async fn resolve(&self, token: &str) -> Result<ProjectId, AuthError> {
        (**self).resolve(token).await
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct LookupError(pub String);

/// Read-only access to stored API key records.
#[async_trait]
pub trait ApiKeyLookup: Send + Sync {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, LookupError>;
}

/// Hashes the presented key, looks it up and checks expiry.
#[derive(Clone)]
pub struct ApiKeyAuthProvider {
    keys: Arc<dyn ApiKeyLookup>,
}

impl ApiKeyAuthProvider {
    pub fn new(keys: Arc<dyn ApiKeyLookup>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl AuthProvider for ApiKeyAuthProvider {
    async fn resolve(&self, token: &str) -> Result<ProjectId, AuthError> {
        let key = self
            .keys
            .find_by_hash(&hash_api_key(token))
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?
            .ok_or(AuthError::Invalid)?;

        match key.status_at(Utc::now()) {
            KeyStatus::Active => Ok(key.project_id),
            KeyStatus::Expired => {
                tracing::debug!(api_key_id = %key.id, "rejected expired API key");
                Err(AuthError::Expired)
            }
        }
    }
}
