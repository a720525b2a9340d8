//! Aggregation id lookup.
//!
//! Verifiers may fetch every status list of several pools through one
//! public aggregation id. [`AggregationIndex`] maps aggregation ids to
//! their pools and back. A pool without an explicit aggregation id is
//! aggregated under its own pool id.

use std::collections::{BTreeMap, HashMap};

use super::PoolId;

/// Bidirectional lookup between aggregation ids and pool ids.
///
/// Built once from configuration and immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct AggregationIndex {
    pools_by_aggregation: BTreeMap<String, Vec<PoolId>>,
    aggregation_by_pool: HashMap<PoolId, String>,
}

impl AggregationIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the index from `(pool id, optional aggregation id)` pairs.
    #[must_use]
    pub fn from_pools<'a, I>(pools: I) -> Self
    where
        I: IntoIterator<Item = (&'a PoolId, Option<&'a str>)>,
    {
        let mut index = Self::new();
        for (pool_id, aggregation_id) in pools {
            index.insert(pool_id.clone(), aggregation_id);
        }
        index
    }

    /// Registers `pool_id` under `aggregation_id`, or under its own id when
    /// none is given. Re-registering a pool moves it.
    pub fn insert(&mut self, pool_id: PoolId, aggregation_id: Option<&str>) {
        let aggregation_id = aggregation_id.map_or_else(|| pool_id.to_string(), str::to_string);
        if let Some(previous) = self.aggregation_by_pool.remove(&pool_id)
            && let Some(pools) = self.pools_by_aggregation.get_mut(&previous)
        {
            pools.retain(|p| p != &pool_id);
            if pools.is_empty() {
                self.pools_by_aggregation.remove(&previous);
            }
        }
        let pools = self
            .pools_by_aggregation
            .entry(aggregation_id.clone())
            .or_default();
        pools.push(pool_id.clone());
        pools.sort();
        self.aggregation_by_pool.insert(pool_id, aggregation_id);
    }

    /// Pools aggregated under `aggregation_id`, sorted by id.
    #[must_use]
    pub fn pools(&self, aggregation_id: &str) -> Option<&[PoolId]> {
        self.pools_by_aggregation
            .get(aggregation_id)
            .map(Vec::as_slice)
    }

    /// Aggregation id of `pool_id`.
    #[must_use]
    pub fn aggregation_id(&self, pool_id: &PoolId) -> Option<&str> {
        self.aggregation_by_pool.get(pool_id).map(String::as_str)
    }

    /// Public URI of the aggregation containing `pool_id`.
    #[must_use]
    pub fn aggregation_uri(&self, pool_id: &PoolId, public_url: &str) -> Option<String> {
        self.aggregation_id(pool_id).map(|id| {
            format!("{}/aggregation/{id}", public_url.trim_end_matches('/'))
        })
    }

    /// All aggregation ids.
    pub fn aggregation_ids(&self) -> impl Iterator<Item = &str> {
        self.pools_by_aggregation.keys().map(String::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn pool(id: &str) -> PoolId {
        let Ok(id) = PoolId::new(id) else {
            panic!("valid pool id");
        };
        id
    }

    #[test]
    fn pools_default_to_their_own_id() {
        let mut index = AggregationIndex::new();
        index.insert(pool("mdl"), None);
        assert_eq!(index.aggregation_id(&pool("mdl")), Some("mdl"));
        assert_eq!(index.pools("mdl"), Some(&[pool("mdl")][..]));
    }

    #[test]
    fn shared_aggregation_lists_all_pools() {
        let a = pool("a");
        let b = pool("b");
        let index = AggregationIndex::from_pools([(&b, Some("all")), (&a, Some("all"))]);
        assert_eq!(index.pools("all"), Some(&[pool("a"), pool("b")][..]));
        assert_eq!(index.aggregation_id(&a), Some("all"));
        assert!(index.pools("a").is_none());
    }

    #[test]
    fn reinserting_moves_pool() {
        let mut index = AggregationIndex::new();
        index.insert(pool("a"), Some("x"));
        index.insert(pool("a"), Some("y"));
        assert!(index.pools("x").is_none());
        assert_eq!(index.aggregation_id(&pool("a")), Some("y"));
        assert_eq!(index.aggregation_ids().collect::<Vec<_>>(), vec!["y"]);
    }

    #[test]
    fn aggregation_uri_uses_public_url() {
        let mut index = AggregationIndex::new();
        index.insert(pool("a"), Some("shared"));
        assert_eq!(
            index.aggregation_uri(&pool("a"), "https://status.example.com/"),
            Some("https://status.example.com/aggregation/shared".to_string())
        );
    }
}
