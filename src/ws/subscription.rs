//! Per-connection subscription manager.
//!
//! Tracks which pools a WebSocket client follows and filters events on
//! the server side.

use std::collections::HashSet;

use crate::domain::PoolId;

/// Manages the set of pool subscriptions for a single WebSocket connection.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    /// Subscribed pool IDs. Ignored while `subscribe_all` is set.
    pool_ids: HashSet<PoolId>,
    subscribe_all: bool,
}

impl SubscriptionManager {
    /// Creates a new empty subscription manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds pool IDs to the subscription set, optionally enabling the
    /// wildcard.
    pub fn subscribe(&mut self, ids: &[PoolId], wildcard: bool) {
        if wildcard {
            self.subscribe_all = true;
        }
        self.pool_ids.extend(ids.iter().cloned());
    }

    /// Removes pool IDs from the subscription set. The wildcard is
    /// cleared when `wildcard` is set.
    pub fn unsubscribe(&mut self, ids: &[PoolId], wildcard: bool) {
        if wildcard {
            self.subscribe_all = false;
        }
        for id in ids {
            self.pool_ids.remove(id);
        }
    }

    /// Returns `true` if an event of the given pool passes the filter.
    ///
    /// Events without a pool (cache lookups of unknown lists) only reach
    /// wildcard subscribers.
    #[must_use]
    pub fn matches(&self, pool_id: Option<&PoolId>) -> bool {
        self.subscribe_all || pool_id.is_some_and(|id| self.pool_ids.contains(id))
    }

    /// Returns the number of explicitly subscribed pool IDs.
    #[must_use]
    pub fn count(&self) -> usize {
        self.pool_ids.len()
    }

    /// Returns `true` if the wildcard subscription is active.
    #[must_use]
    pub fn is_subscribed_all(&self) -> bool {
        self.subscribe_all
    }
}
