//! Syntactic/semantic checks for inbound event requests.
//!
//! Pure and I/O free. Checks run in a fixed order and the first failure is
//! returned; errors are never aggregated.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::event::{EventRequest, Metadata};

pub const MAX_EVENT_NAME_LEN: usize = 100;
pub const MAX_USER_ID_LEN: usize = 100;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_METADATA_KEY_LEN: usize = 100;
pub const MAX_METADATA_VALUE_LEN: usize = 1000;

static EVENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$").expect("valid regex"));
static USER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid regex"));
static IDEMPOTENCY_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]+$").expect("valid regex"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event_name is required")]
    MissingEventName,

    #[error("event_name must be at most {MAX_EVENT_NAME_LEN} characters")]
    EventNameTooLong,

    #[error("event_name must be alphanumeric with underscores, starting with a letter")]
    InvalidEventName,

    #[error("user_id must be at most {MAX_USER_ID_LEN} characters")]
    UserIdTooLong,

    #[error("user_id must be alphanumeric with underscores and hyphens")]
    InvalidUserId,

    #[error("idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters")]
    IdempotencyKeyTooLong,

    #[error("idempotency_key must be alphanumeric")]
    InvalidIdempotencyKey,

    #[error("metadata key too long: {0}")]
    MetadataKeyTooLong(String),

    #[error("metadata value too long for key: {0}")]
    MetadataValueTooLong(String),

    #[error("batch must contain between 1 and 100 events, got {0}")]
    BatchSize(usize),
}

/// Request validator.
///
/// Surrounding whitespace on `event_name` is ignored: `" signup "` is accepted
/// and a whitespace-only name counts as missing. The length limit and the name
/// pattern apply to the trimmed text, which is also what ingestion stores
/// (lowercased). Other fields are checked exactly as sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a single request. Any name accepted here normalizes to
    /// `^[a-z][a-z0-9_]*$`.
    pub fn validate(&self, req: &EventRequest) -> Result<(), ValidationError> {
        validate_event_name(&req.event_name)?;

        if let Some(user_id) = &req.user_id {
            validate_user_id(user_id)?;
        }

        if let Some(key) = &req.idempotency_key {
            validate_idempotency_key(key)?;
        }

        if let Some(metadata) = &req.metadata {
            validate_metadata(metadata)?;
        }

        Ok(())
    }
}

fn validate_event_name(name: &str) -> Result<(), ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::MissingEventName);
    }
    if name.chars().count() > MAX_EVENT_NAME_LEN {
        return Err(ValidationError::EventNameTooLong);
    }
    if !EVENT_NAME.is_match(name) {
        return Err(ValidationError::InvalidEventName);
    }
    Ok(())
}

fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if user_id.chars().count() > MAX_USER_ID_LEN {
        return Err(ValidationError::UserIdTooLong);
    }
    if !USER_ID.is_match(user_id) {
        return Err(ValidationError::InvalidUserId);
    }
    Ok(())
}

fn validate_idempotency_key(key: &str) -> Result<(), ValidationError> {
    if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(ValidationError::IdempotencyKeyTooLong);
    }
    if !IDEMPOTENCY_KEY.is_match(key) {
        return Err(ValidationError::InvalidIdempotencyKey);
    }
    Ok(())
}

fn validate_metadata(metadata: &Metadata) -> Result<(), ValidationError> {
    for (key, value) in metadata {
        if key.chars().count() > MAX_METADATA_KEY_LEN {
            return Err(ValidationError::MetadataKeyTooLong(key.clone()));
        }
        if value.textual_len() > MAX_METADATA_VALUE_LEN {
            return Err(ValidationError::MetadataValueTooLong(key.clone()));
        }
    }
    Ok(())
}
