//! HTTP API: event ingestion endpoints, bearer authentication and request
//! metrics.

pub mod app;
pub mod context;
pub mod middleware;
