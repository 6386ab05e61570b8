use axum::{Router, routing::post};

pub mod events;
pub mod system;

/// Router for all authenticated (project-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/events", post(events::ingest_event))
        .route("/events/batch", post(events::ingest_batch))
}
