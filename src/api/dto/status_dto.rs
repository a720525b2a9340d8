//! Status update and read DTOs.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Body of `POST /api/update-status`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    /// List URI of the reference.
    pub uri: String,
    /// Index of the reference.
    pub index: u64,
    /// New status value, below `2^bits`.
    pub value: u8,
}

/// Query of `GET /api/status`.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatusQuery {
    /// List URI of the reference.
    pub uri: String,
    /// Index of the reference.
    pub index: u64,
}

/// Published status of one reference.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    /// List URI.
    pub uri: String,
    /// Index.
    pub index: u64,
    /// Value in the currently published token.
    pub value: u8,
}

/// Lists of an aggregation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AggregationResponse {
    /// URIs of all lists of the aggregation's pools.
    pub status_lists: Vec<String>,
}
