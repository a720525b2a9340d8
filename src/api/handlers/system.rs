//! System endpoints: health check and pool inspection.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::domain::PoolId;
use crate::domain::pool_entry::PoolSummary;
use crate::error::{ErrorResponse, ServiceError};
use crate::service::AllocatorState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    pools: usize,
}

/// `GET /health` — Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health status, version, current timestamp and the number of configured pools.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pools: state.service.registry().len().await,
        }),
    )
}

/// `GET /api/pools` — Configured pools.
#[utoipa::path(
    get,
    path = "/api/pools",
    tag = "System",
    summary = "List pools",
    description = "Returns the shape and policies of every configured pool.",
    responses(
        (status = 200, description = "Pool summaries", body = Vec<PoolSummary>),
    )
)]
pub async fn list_pools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.pools().await)
}

/// Allocation state of one pool.
#[derive(Debug, Serialize, ToSchema)]
pub struct PoolStateResponse {
    pool_id: String,
    state: AllocatorState,
}

/// `GET /api/pools/{pool_id}/state` — Allocation state of a pool.
///
/// # Errors
///
/// Returns [`ServiceError::PoolNotFound`] for an unknown pool.
#[utoipa::path(
    get,
    path = "/api/pools/{pool_id}/state",
    tag = "System",
    summary = "Pool allocation state",
    description = "Reports whether the pool needs a list, is active, near exhaustion or exhausted.",
    params(("pool_id" = String, Path, description = "Pool identifier")),
    responses(
        (status = 200, description = "Allocation state", body = PoolStateResponse),
        (status = 400, description = "Unknown pool", body = ErrorResponse),
    )
)]
pub async fn pool_state(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = PoolId::new(pool_id.as_str()).map_err(|_| ServiceError::PoolNotFound(pool_id.clone()))?;
    let allocator_state = state.service.pool_state(&id).await?;
    Ok(Json(PoolStateResponse {
        pool_id,
        state: allocator_state,
    }))
}

/// System routes mounted at the root level.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/pools", get(list_pools))
        .route("/api/pools/{pool_id}/state", get(pool_state))
}
