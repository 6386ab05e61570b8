use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use pulse_auth::AuthError;
use pulse_infra::IngestError;

pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    match &err {
        IngestError::Validation(e) => json_error(StatusCode::BAD_REQUEST, err.code(), e.to_string()),
        IngestError::Store(_) | IngestError::Timeout(_) => {
            tracing::error!(error = %err, "ingestion failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.code(),
                "failed to store event",
            )
        }
    }
}

pub fn auth_error_to_response(err: AuthError) -> axum::response::Response {
    match err {
        AuthError::Unavailable(msg) => {
            tracing::error!(error = %msg, "auth backend unavailable");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "auth_unavailable",
                "authentication is temporarily unavailable",
            )
        }
        other => json_error(StatusCode::UNAUTHORIZED, other.code(), other.to_string()),
    }
}

/// Malformed JSON, wrong content type, nested metadata and the like.
pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
