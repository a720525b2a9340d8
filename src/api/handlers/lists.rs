//! Public list and aggregation handlers.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::AggregationResponse;
use crate::api::headers::{
    STATUS_LIST_JWT, accepts_status_list, http_date, if_none_match, not_modified_since,
};
use crate::app_state::AppState;
use crate::domain::ListId;
use crate::error::{ErrorResponse, ServiceError};

/// `GET /{list_id}` — Serve the published token of a list.
///
/// # Errors
///
/// Returns [`ServiceError::ListNotFound`] if the id is not a UUID, the
/// list does not exist or was never published, and
/// [`ServiceError::UnsupportedMediaType`] if `Accept` rules out the token
/// type.
#[utoipa::path(
    get,
    path = "/{list_id}",
    tag = "Lists",
    summary = "Fetch a status list token",
    description = "Returns the signed status list token. Answers `304 Not Modified` when `If-None-Match` carries the current ETag, or when no `If-None-Match` is sent and `If-Modified-Since` is not older than the publication time.",
    params(("list_id" = uuid::Uuid, Path, description = "List identifier")),
    responses(
        (status = 200, description = "Signed token", content_type = "application/statuslist+jwt", body = String),
        (status = 304, description = "Token unchanged"),
        (status = 404, description = "Unknown list", body = ErrorResponse),
        (status = 415, description = "`Accept` excludes the token type", body = ErrorResponse),
    )
)]
pub async fn serve_list(
    State(state): State<AppState>,
    Path(list_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let list_id = list_id
        .parse::<uuid::Uuid>()
        .map(ListId::from_uuid)
        .map_err(|_| ServiceError::ListNotFound(list_id.clone()))?;
    if !accepts_status_list(&headers) {
        return Err(ServiceError::UnsupportedMediaType(format!(
            "only {STATUS_LIST_JWT} is served"
        )));
    }
    let cached = state.service.token(list_id).await?;

    let etag = cached.etag();
    let published = cached.metadata.created_at;
    let response_headers = [
        (header::ETAG, etag.clone()),
        (header::LAST_MODIFIED, http_date(published)),
        (header::CACHE_CONTROL, "no-cache".to_string()),
        (header::VARY, "Accept".to_string()),
    ];

    // If-None-Match takes precedence over If-Modified-Since.
    let unchanged = if headers.contains_key(header::IF_NONE_MATCH) {
        if_none_match(&headers, &etag)
    } else {
        not_modified_since(&headers, published)
    };
    if unchanged {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }
    Ok((
        StatusCode::OK,
        response_headers,
        [(header::CONTENT_TYPE, STATUS_LIST_JWT)],
        cached.token.clone(),
    )
        .into_response())
}

/// `GET /aggregation/{aggregation_id}` — List URIs of an aggregation.
///
/// # Errors
///
/// Returns [`ServiceError::ListNotFound`] for an unknown aggregation or
/// one without lists.
#[utoipa::path(
    get,
    path = "/aggregation/{aggregation_id}",
    tag = "Lists",
    summary = "List the status lists of an aggregation",
    description = "Returns the URIs of every list of every pool sharing the aggregation id.",
    params(("aggregation_id" = String, Path, description = "Aggregation identifier")),
    responses(
        (status = 200, description = "List URIs", body = AggregationResponse),
        (status = 404, description = "Unknown aggregation", body = ErrorResponse),
    )
)]
pub async fn serve_aggregation(
    State(state): State<AppState>,
    Path(aggregation_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let status_lists = state.service.aggregation(&aggregation_id).await?;
    if status_lists.is_empty() {
        return Err(ServiceError::ListNotFound(format!(
            "aggregation {aggregation_id} has no lists"
        )));
    }
    Ok(Json(AggregationResponse { status_lists }))
}

/// Public list routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/aggregation/{aggregation_id}", get(serve_aggregation))
        .route("/{list_id}", get(serve_list))
}
