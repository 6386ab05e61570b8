use axum::http::StatusCode;

/// Liveness only.
pub async fn health() -> StatusCode {
    StatusCode::OK
}
