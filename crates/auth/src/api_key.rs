use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use pulse_core::{ApiKeyId, ProjectId};

/// Stored API key record.
///
/// Only the sha256 hash of the secret is kept. Records are created out of band
/// and are read-only to authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub project_id: ProjectId,
    /// Lowercase hex sha256 of the raw key. Unique.
    pub key_hash: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Expired,
}

impl ApiKey {
    /// Build a record for `raw_key`, hashing it.
    pub fn issue(project_id: ProjectId, name: impl Into<String>, raw_key: &str) -> Self {
        Self {
            id: ApiKeyId::new(),
            project_id,
            key_hash: hash_api_key(raw_key),
            name: name.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// A key is invalid once `expires_at` is in the past.
    pub fn status_at(&self, now: DateTime<Utc>) -> KeyStatus {
        match self.expires_at {
            Some(expires_at) if expires_at < now => KeyStatus::Expired,
            _ => KeyStatus::Active,
        }
    }
}

/// Lowercase hex sha256 of a raw API key.
pub fn hash_api_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        assert_eq!(
            hash_api_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn issue_never_stores_the_raw_key() {
        let key = ApiKey::issue(ProjectId::new(), "ci", "secret-key");
        assert_ne!(key.key_hash, "secret-key");
        assert_eq!(key.key_hash.len(), 64);
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let now = Utc::now();
        let key = ApiKey::issue(ProjectId::new(), "ci", "k");
        assert_eq!(key.status_at(now), KeyStatus::Active);

        let past = key.clone().with_expiry(now - Duration::seconds(1));
        assert_eq!(past.status_at(now), KeyStatus::Expired);

        let future = key.with_expiry(now + Duration::hours(1));
        assert_eq!(future.status_at(now), KeyStatus::Active);
    }
}
