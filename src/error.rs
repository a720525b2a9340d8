//! Service error types with HTTP status code mapping.
//!
//! [`ServiceError`] is the central error type for the service. Each variant
//! maps to a specific HTTP status code and structured JSON error response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 1001,
///     "kind": "INDEX_OUT_OF_BOUNDS",
///     "message": "index 130 out of range for list of size 128",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`ServiceError`]).
    pub code: u32,
    /// Stable machine-readable error kind (e.g. `"NO_SUCH_POOL"`).
    pub kind: &'static str,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category             | HTTP Status                    |
/// |-----------|----------------------|--------------------------------|
/// | 1000–1999 | Validation           | 400 Bad Request / 415          |
/// | 2000–2999 | Auth / Not Found     | 403 Forbidden / 404 / 409      |
/// | 3000–3999 | Server               | 500 Internal Server Error      |
/// | 4000–4999 | Allocation           | 429 / 503                      |
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Status index outside `0..size` of the list.
    #[error("index {index} out of range for list of size {size}")]
    OutOfRange {
        /// Offending index.
        index: u64,
        /// Size of the list.
        size: u64,
    },

    /// Status value does not fit into the list's bit width.
    #[error("value {value} out of range for {bits} bit(s)")]
    ValueOutOfRange {
        /// Offending value.
        value: u8,
        /// Bit width of the list.
        bits: u8,
    },

    /// The persistent counter could not be reached; no index was handed out.
    #[error("allocation unavailable: {0}")]
    AllocationUnavailable(String),

    /// The prefetch buffer was empty and the pool is configured to fail fast.
    #[error("prefetch buffer of pool {0} underflown")]
    PrefetchUnderflow(String),

    /// A freed reference was never issued by this pool.
    #[error("unknown reference {uri}#{index}")]
    UnknownReference {
        /// List URI of the reference.
        uri: String,
        /// Index of the reference.
        index: u64,
    },

    /// A token write lost the race against a concurrently advanced version.
    #[error("stale write for list {uri}: expected version {expected}, found {found}")]
    StaleWrite {
        /// List URI being written.
        uri: String,
        /// Version observed before writing.
        expected: u64,
        /// Version found in the store at commit time.
        found: u64,
    },

    /// A ledger reached its capacity and rejected a key (fail-closed).
    #[error("ledger capacity of {0} entries exceeded")]
    CapacityExceeded(usize),

    /// Pool with the given ID is not configured.
    #[error("no pool with id {0}")]
    PoolNotFound(String),

    /// List with the given ID or URI does not exist.
    #[error("no list {0}")]
    ListNotFound(String),

    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request's `Accept` header rules out every representation.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Missing or invalid API key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A request identifier was presented twice within its validity window.
    #[error("replayed request {0}")]
    ReplayedRequest(String),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Token signing failed.
    #[error("signing error: {0}")]
    Signing(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::OutOfRange { .. } => 1002,
            Self::ValueOutOfRange { .. } => 1003,
            Self::PoolNotFound(_) => 1004,
            Self::UnsupportedMediaType(_) => 1005,
            Self::Unauthorized(_) => 2001,
            Self::ListNotFound(_) => 2002,
            Self::UnknownReference { .. } => 2003,
            Self::ReplayedRequest(_) => 2004,
            Self::StaleWrite { .. } => 2005,
            Self::Internal(_) => 3000,
            Self::Persistence(_) => 3001,
            Self::Signing(_) => 3002,
            Self::Config(_) => 3003,
            Self::CapacityExceeded(_) => 3004,
            Self::AllocationUnavailable(_) => 4001,
            Self::PrefetchUnderflow(_) => 4002,
        }
    }

    /// Returns the stable error kind string for this variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "BAD_REQUEST",
            Self::OutOfRange { .. } => "INDEX_OUT_OF_BOUNDS",
            Self::ValueOutOfRange { .. } => "VALUE_OUT_OF_RANGE",
            Self::PoolNotFound(_) => "NO_SUCH_POOL",
            Self::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::ListNotFound(_) => "NO_SUCH_LIST",
            Self::UnknownReference { .. } => "UNKNOWN_REFERENCE",
            Self::ReplayedRequest(_) => "REPLAYED_REQUEST",
            Self::StaleWrite { .. } => "STALE_WRITE",
            Self::Internal(_) => "INTERNAL_SERVER_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Signing(_) => "SIGNING_ERROR",
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::AllocationUnavailable(_) => "ALLOCATION_UNAVAILABLE",
            Self::PrefetchUnderflow(_) => "RATE_LIMIT_REACHED",
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::OutOfRange { .. }
            | Self::ValueOutOfRange { .. }
            | Self::PoolNotFound(_)
            | Self::UnknownReference { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::ListNotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ReplayedRequest(_) | Self::StaleWrite { .. } => StatusCode::CONFLICT,
            Self::PrefetchUnderflow(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::AllocationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Persistence(_)
            | Self::Signing(_)
            | Self::Config(_)
            | Self::CapacityExceeded(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "request failed");
        } else {
            tracing::debug!(error = %self, code = self.error_code(), "request rejected");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                kind: self.kind(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
