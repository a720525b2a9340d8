//! Status update and internal read handlers.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{StatusQuery, StatusResponse, UpdateStatusRequest};
use crate::api::headers::{API_KEY, REQUEST_ID, header_str};
use crate::app_state::AppState;
use crate::domain::Reference;
use crate::error::{ErrorResponse, ServiceError};

/// `POST /api/update-status` — Set the status of a reference.
///
/// # Errors
///
/// Returns [`ServiceError`] for unknown lists, bad keys, replayed request
/// ids or out-of-range input.
#[utoipa::path(
    post,
    path = "/api/update-status",
    tag = "Status",
    summary = "Update a status value",
    description = "Writes `value` at `index` of the list `uri`. The change is published with the next token of the list. A repeated `X-Request-Id` is rejected.",
    request_body = UpdateStatusRequest,
    params(
        ("X-Api-Key" = String, Header, description = "API key of the owning pool"),
        ("X-Request-Id" = Option<String>, Header, description = "Replay-checked request id"),
    ),
    responses(
        (status = 204, description = "Status updated"),
        (status = 400, description = "Index or value out of range", body = ErrorResponse),
        (status = 403, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "Unknown list", body = ErrorResponse),
        (status = 409, description = "Replayed request", body = ErrorResponse),
    )
)]
pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let Json(req) = body.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;
    state
        .service
        .update_status(
            &Reference::new(req.uri, req.index),
            req.value,
            header_str(&headers, API_KEY),
            header_str(&headers, REQUEST_ID),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/status` — Published status of a reference.
///
/// # Errors
///
/// Returns [`ServiceError::ListNotFound`] for unknown or unpublished lists
/// and [`ServiceError::OutOfRange`] for indices past the list end.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "Status",
    summary = "Read a published status value",
    description = "Reads the value of `index` from the currently published token of `uri`.",
    params(StatusQuery),
    responses(
        (status = 200, description = "Published value", body = StatusResponse),
        (status = 400, description = "Index out of range", body = ErrorResponse),
        (status = 404, description = "Unknown list", body = ErrorResponse),
    )
)]
pub async fn read_status(
    State(state): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let Query(query) = query.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;
    let reference = Reference::new(query.uri, query.index);
    let value = state.service.status(&reference).await?;
    Ok(Json(StatusResponse {
        uri: reference.uri,
        index: reference.index,
        value,
    }))
}

/// Status routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/update-status", post(update_status))
        .route("/api/status", get(read_status))
}
