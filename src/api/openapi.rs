//! OpenAPI document of the REST API.

use utoipa::OpenApi;

use super::dto::{
    AggregationResponse, FreeReferenceRequest, ReferencesResponse, StatusResponse,
    UpdateStatusRequest,
};
use super::handlers::{lists, references, status, system};
use crate::domain::Reference;
use crate::domain::pool_entry::PoolSummary;
use crate::error::{ErrorBody, ErrorResponse};
use crate::service::AllocatorState;

/// Generated OpenAPI description, served at `/api-docs/openapi.json`.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "status-list-service",
        description = "Allocates credential status references and publishes signed status list tokens."
    ),
    paths(
        references::new_references,
        references::free_reference,
        status::update_status,
        status::read_status,
        lists::serve_list,
        lists::serve_aggregation,
        system::health_handler,
        system::list_pools,
        system::pool_state,
    ),
    components(schemas(
        Reference,
        ReferencesResponse,
        FreeReferenceRequest,
        UpdateStatusRequest,
        StatusResponse,
        AggregationResponse,
        PoolSummary,
        AllocatorState,
        system::HealthResponse,
        system::PoolStateResponse,
        ErrorResponse,
        ErrorBody,
    )),
    tags(
        (name = "References", description = "Reference allocation"),
        (name = "Status", description = "Status updates"),
        (name = "Lists", description = "Published status lists"),
        (name = "System", description = "Health and pool inspection"),
    )
)]
pub struct ApiDoc;
