//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: shared handles (ingestion service, auth provider, metrics)
//! - `routes/`: HTTP handlers
//! - `dto.rs`: response bodies
//! - `errors.rs`: consistent JSON error responses

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(services: AppServices) -> Router {
    let auth_state = middleware::AuthState {
        provider: services.auth.clone(),
    };
    let metrics = services.metrics.clone();

    // Ingestion routes: require a valid API key.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn_with_state(
            metrics,
            middleware::metrics_middleware,
        )))
}
