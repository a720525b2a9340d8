//! Reference allocation DTOs.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::domain::Reference;

/// Query of `POST /pools/{pool_id}/new-references`.
///
/// `count` is accepted as an alias of `amount`.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct NewReferencesQuery {
    /// Number of references to reserve. Defaults to 1.
    pub amount: Option<u64>,
    /// Alias of `amount`.
    pub count: Option<u64>,
}

impl NewReferencesQuery {
    /// Requested amount, `amount` taking precedence over `count`.
    #[must_use]
    pub fn requested(&self) -> u64 {
        self.amount.or(self.count).unwrap_or(1)
    }
}

/// Reserved references.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReferencesResponse {
    /// One entry per reserved index.
    pub references: Vec<Reference>,
}

/// Body of `POST /api/free-reference`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FreeReferenceRequest {
    /// List URI of the reference.
    pub uri: String,
    /// Index of the reference.
    pub index: u64,
}
