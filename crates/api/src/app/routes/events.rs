use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use pulse_events::{BatchEventRequest, EventRequest};

use crate::app::dto::{BatchAccepted, EventAccepted};
use crate::app::errors::{ingest_error_to_response, json_rejection_to_response};
use crate::app::services::AppServices;
use crate::context::{ClientInfo, ProjectContext};

pub async fn ingest_event(
    Extension(services): Extension<AppServices>,
    Extension(project): Extension<ProjectContext>,
    client: ClientInfo,
    body: Result<Json<EventRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejection_to_response(rejection),
    };

    match services
        .ingestion
        .ingest(request, project.project_id(), client.ip_address, client.user_agent)
        .await
    {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(EventAccepted::from(&outcome))).into_response(),
        Err(err) => ingest_error_to_response(err),
    }
}

pub async fn ingest_batch(
    Extension(services): Extension<AppServices>,
    Extension(project): Extension<ProjectContext>,
    client: ClientInfo,
    body: Result<Json<BatchEventRequest>, JsonRejection>,
) -> Response {
    let Json(batch) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejection_to_response(rejection),
    };

    match services
        .ingestion
        .ingest_batch(batch, project.project_id(), client.ip_address, client.user_agent)
        .await
    {
        Ok(results) => (
            StatusCode::ACCEPTED,
            Json(BatchAccepted::from(results.as_slice())),
        )
            .into_response(),
        Err(err) => ingest_error_to_response(err),
    }
}
