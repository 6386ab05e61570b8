//! `pulse-core`: foundation building blocks shared by every pulse crate.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::IdError;
pub use id::{ApiKeyId, EventId, ProjectId};
