//! Reference allocation handlers.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::dto::{FreeReferenceRequest, NewReferencesQuery, ReferencesResponse};
use crate::api::headers::{API_KEY, IDEMPOTENCY_KEY, header_str};
use crate::app_state::AppState;
use crate::domain::{PoolId, Reference};
use crate::error::{ErrorResponse, ServiceError};

/// `POST /pools/{pool_id}/new-references` — Reserve references.
///
/// # Errors
///
/// Returns [`ServiceError`] for unknown pools, bad keys, invalid amounts
/// or an unavailable store.
#[utoipa::path(
    post,
    path = "/pools/{pool_id}/new-references",
    tag = "References",
    summary = "Reserve status list references",
    description = "Hands out `amount` (alias `count`, default 1) unused `(uri, index)` pairs from the pool. A repeated `Idempotency-Key` returns the references of the first call.",
    params(
        ("pool_id" = String, Path, description = "Pool identifier"),
        NewReferencesQuery,
        ("X-Api-Key" = String, Header, description = "Pool API key"),
        ("Idempotency-Key" = Option<String>, Header, description = "Retry key"),
    ),
    responses(
        (status = 200, description = "Reserved references", body = ReferencesResponse),
        (status = 400, description = "Unknown pool or invalid amount", body = ErrorResponse),
        (status = 403, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 429, description = "Prefetch buffer underflow", body = ErrorResponse),
        (status = 503, description = "Allocation unavailable", body = ErrorResponse),
    )
)]
pub async fn new_references(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
    query: Result<Query<NewReferencesQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let Query(query) = query.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;
    let pool_id = PoolId::new(pool_id.as_str())
        .map_err(|_| ServiceError::PoolNotFound(pool_id.clone()))?;

    let references = state
        .service
        .reserve(
            &pool_id,
            query.requested(),
            header_str(&headers, API_KEY),
            header_str(&headers, IDEMPOTENCY_KEY),
        )
        .await?;
    Ok(Json(ReferencesResponse { references }))
}

/// `POST /api/free-reference` — Release an issued reference.
///
/// # Errors
///
/// Returns [`ServiceError::UnknownReference`] for references never handed
/// out, or an authentication/store error.
#[utoipa::path(
    post,
    path = "/api/free-reference",
    tag = "References",
    summary = "Release a reference",
    description = "Retires the reference, or makes it reusable when the pool's reuse policy is `reuse`.",
    request_body = FreeReferenceRequest,
    params(("X-Api-Key" = String, Header, description = "Pool API key")),
    responses(
        (status = 204, description = "Reference released"),
        (status = 400, description = "Unknown reference", body = ErrorResponse),
        (status = 403, description = "Missing or invalid API key", body = ErrorResponse),
    )
)]
pub async fn free_reference(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<FreeReferenceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let Json(req) = body.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;
    state
        .service
        .free(
            &Reference::new(req.uri, req.index),
            header_str(&headers, API_KEY),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reference routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/pools/{pool_id}/new-references", post(new_references))
        .route("/api/free-reference", post(free_reference))
}
