//! Errors raised by the core primitives.

use thiserror::Error;

/// An identifier string that is not a UUID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {reason}")]
pub struct IdError {
    /// Which identifier type was being parsed, e.g. `EventId`.
    pub kind: &'static str,
    pub reason: String,
}
