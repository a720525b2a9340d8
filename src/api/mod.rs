//! REST API layer: route handlers, DTOs, and router composition.
//!
//! Public list tokens are served at the root (`/{list_id}`,
//! `/aggregation/{id}`), issuer operations under `/pools` and `/api`.

pub mod dto;
pub mod handlers;
pub mod headers;
pub mod openapi;

use axum::Router;

use crate::app_state::AppState;

/// Builds the complete API router with all REST endpoints.
///
/// With the `swagger-ui` feature the interactive documentation is served
/// at `/swagger-ui`.
pub fn build_router() -> Router<AppState> {
    let router = Router::new().merge(handlers::routes());
    with_docs(router)
}

#[cfg(feature = "swagger-ui")]
fn with_docs(router: Router<AppState>) -> Router<AppState> {
    use utoipa::OpenApi as _;
    use utoipa_swagger_ui::SwaggerUi;

    router.merge(
        SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
    )
}

#[cfg(not(feature = "swagger-ui"))]
fn with_docs(router: Router<AppState>) -> Router<AppState> {
    use axum::Json;
    use axum::routing::get;
    use utoipa::OpenApi as _;

    router.route(
        "/api-docs/openapi.json",
        get(|| async { Json(openapi::ApiDoc::openapi()) }),
    )
}
