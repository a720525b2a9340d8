//! # status-list-service
//!
//! REST API and WebSocket service that hands out, tracks and publishes
//! credential status references.
//!
//! Issuers reserve `(uri, index)` references from a configured pool, later
//! change the status value at that index, and verifiers fetch the signed
//! status list token from the list URI. Several instances may share one
//! store; indices are claimed atomically from the store so no reference is
//! ever issued twice.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)
//!     │
//!     ├── REST Handlers (api/)
//!     ├── WS Handler (ws/)
//!     │
//!     ├── StatusListService (service/)
//!     │     ├── IndexAllocator      prefetch buffer per pool
//!     │     ├── PrecreationScheduler  successor lists
//!     │     ├── PoolWriter          signs and publishes tokens
//!     │     └── StatusListCache     decoded published lists
//!     ├── EventBus, PoolRegistry (domain/)
//!     ├── ExpiringLedger, LimitedMapStorage (ledger/)
//!     │
//!     └── StatusStore: memory or PostgreSQL (persistence/)
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod persistence;
pub mod service;
pub mod ws;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Builds the full application router: REST API, docs and the `/ws` feed.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(api::build_router())
        .route("/ws", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
