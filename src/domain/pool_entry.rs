//! Pool entry bundling a pool's configuration with its workers.

use std::sync::Arc;

use serde::Serialize;
use utoipa::ToSchema;

use super::PoolId;
use crate::config::{PoolConfig, ReusePolicy, UnderflowPolicy};
use crate::service::{IndexAllocator, PoolWriter, PrecreationScheduler};

/// Everything the service keeps per configured pool.
///
/// Entries are built once at startup and never mutated; all mutable
/// state lives in the store or behind the workers' own locks.
#[derive(Debug)]
pub struct PoolEntry {
    /// Validated configuration.
    pub config: Arc<PoolConfig>,
    /// Hands out references.
    pub allocator: Arc<IndexAllocator>,
    /// Publishes tokens.
    pub writer: Arc<PoolWriter>,
    /// Keeps successor lists ready.
    pub precreation: Arc<PrecreationScheduler>,
}

impl PoolEntry {
    /// Pool identifier.
    #[must_use]
    pub fn pool_id(&self) -> &PoolId {
        &self.config.id
    }

    /// `true` if `api_key` is one of the pool's keys.
    #[must_use]
    pub fn accepts_key(&self, api_key: &str) -> bool {
        let hashed = crate::config::hash_api_key(api_key);
        self.config.api_key_hashes.iter().any(|h| *h == hashed)
    }
}

/// Public view of a pool for the health and discovery endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PoolSummary {
    /// Pool identifier.
    #[schema(value_type = String)]
    pub pool_id: PoolId,
    /// Entries per list.
    pub size: u64,
    /// Bits per entry.
    pub bits: u8,
    /// Aggregation the pool is listed under.
    pub aggregation_id: String,
    /// Whether freed indices are reissued.
    pub reuses_indices: bool,
    /// Whether an empty prefetch buffer fails requests.
    pub fails_on_underflow: bool,
    /// Indices buffered in this instance.
    pub buffered: usize,
}

impl From<&PoolEntry> for PoolSummary {
    fn from(entry: &PoolEntry) -> Self {
        let config = &entry.config;
        Self {
            pool_id: config.id.clone(),
            size: config.size,
            bits: config.bits,
            aggregation_id: config
                .aggregation_id
                .clone()
                .unwrap_or_else(|| config.id.to_string()),
            reuses_indices: config.reuse_policy == ReusePolicy::Reuse,
            fails_on_underflow: config.prefetch.on_underflow == UnderflowPolicy::Fail,
            buffered: entry.allocator.buffered(),
        }
    }
}
