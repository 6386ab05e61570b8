use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, State},
    http::{Request, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

use pulse_auth::{AuthError, AuthProvider, parse_bearer};
use pulse_observability::Metrics;

use crate::app::errors::auth_error_to_response;
use crate::context::ProjectContext;

#[derive(Clone)]
pub struct AuthState {
    pub provider: Arc<dyn AuthProvider>,
}

/// Resolve the bearer token into a [`ProjectContext`] request extension.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let resolved = match req.headers().get(AUTHORIZATION).map(|v| v.to_str()) {
        Some(Err(_)) => Err(AuthError::Malformed),
        header => match parse_bearer(header.and_then(Result::ok)) {
            Ok(token) => state.provider.resolve(token).await,
            Err(err) => Err(err),
        },
    };

    match resolved {
        Ok(project_id) => {
            req.extensions_mut().insert(ProjectContext::new(project_id));
            next.run(req).await
        }
        Err(err) => {
            tracing::debug!(code = err.code(), "request rejected by auth");
            auth_error_to_response(err)
        }
    }
}

/// Record a latency observation keyed by `(method, path, status)` for every
/// request. Routed requests use the route template as path.
pub async fn metrics_middleware(
    State(metrics): State<Metrics>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;

    metrics.request_completed(&method, &path, response.status().as_u16(), started.elapsed());
    response
}
