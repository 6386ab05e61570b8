//! Consumer-side normalization of events pulled off the queue.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::event::Event;

static NORMALIZED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid regex"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid event_name after normalization: {0:?}")]
    InvalidEventName(String),
}

/// Re-applies the event-name rules to queued events.
///
/// Queue payloads may come from an older producer or be corrupted in flight, so
/// the consumer never trusts the stored name as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Trim and lowercase `event_name`, then check it against `^[a-z][a-z0-9_]*$`.
    ///
    /// Idempotent: `normalize(normalize(e)) == normalize(e)`. Missing metadata is
    /// already decoded as an empty map by [`Event`]'s deserializer.
    pub fn normalize(&self, mut event: Event) -> Result<Event, FormatError> {
        let name = normalize_name(&event.event_name);
        if !is_normalized_name(&name) {
            return Err(FormatError::InvalidEventName(event.event_name));
        }
        event.event_name = name;
        Ok(event)
    }
}

/// The canonical stored form of an event name.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Whether `name` is already in the form events carry after normalization.
pub fn is_normalized_name(name: &str) -> bool {
    NORMALIZED_NAME.is_match(name)
}
