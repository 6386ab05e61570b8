//! `pulse-auth`: API keys and bearer-token resolution.
//!
//! This crate is decoupled from HTTP and storage: key records are looked up
//! through [`ApiKeyLookup`], implemented by the storage layer.

pub mod api_key;
pub mod provider;

pub use api_key::{ApiKey, KeyStatus, hash_api_key};
pub use provider::{
    ApiKeyAuthProvider, ApiKeyLookup, AuthError, AuthProvider, LookupError, parse_bearer,
};
