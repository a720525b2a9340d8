//! Concurrent lookup of configured pools.
//!
//! [`PoolRegistry`] maps pool ids to their [`PoolEntry`]. Pools are
//! registered at startup; afterwards the registry is read-mostly, so a
//! [`tokio::sync::RwLock`] around the map lets request handlers resolve
//! pools concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::PoolId;
use super::pool_entry::{PoolEntry, PoolSummary};
use crate::error::ServiceError;

/// Central store of all configured pools.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<PoolId, Arc<PoolEntry>>>,
}

impl PoolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a pool.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] if a pool with the same id is
    /// already registered.
    pub async fn insert(&self, entry: PoolEntry) -> Result<Arc<PoolEntry>, ServiceError> {
        let pool_id = entry.pool_id().clone();
        let mut map = self.pools.write().await;
        if map.contains_key(&pool_id) {
            return Err(ServiceError::Config(format!(
                "pool {pool_id} is defined twice"
            )));
        }
        let entry = Arc::new(entry);
        map.insert(pool_id, Arc::clone(&entry));
        Ok(entry)
    }

    /// Looks a pool up by id.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::PoolNotFound`] if no such pool is configured.
    pub async fn get(&self, pool_id: &PoolId) -> Result<Arc<PoolEntry>, ServiceError> {
        let map = self.pools.read().await;
        map.get(pool_id)
            .cloned()
            .ok_or_else(|| ServiceError::PoolNotFound(pool_id.to_string()))
    }

    /// All entries, ordered by pool id.
    pub async fn entries(&self) -> Vec<Arc<PoolEntry>> {
        let map = self.pools.read().await;
        let mut entries: Vec<Arc<PoolEntry>> = map.values().cloned().collect();
        entries.sort_by(|a, b| a.pool_id().cmp(b.pool_id()));
        entries
    }

    /// Summaries of all pools, ordered by pool id.
    pub async fn list(&self) -> Vec<PoolSummary> {
        self.entries()
            .await
            .iter()
            .map(|entry| PoolSummary::from(entry.as_ref()))
            .collect()
    }

    /// Returns the number of pools in the registry.
    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Returns `true` if the registry contains no pools.
    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
