//! REST endpoint handlers organized by resource.

pub mod lists;
pub mod references;
pub mod status;
pub mod system;

use axum::Router;

use crate::app_state::AppState;

/// Composes all resource routes.
///
/// The catch-all `/{list_id}` route only matches paths that no static
/// route claims.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(references::routes())
        .merge(status::routes())
        .merge(system::routes())
        .merge(lists::routes())
}
