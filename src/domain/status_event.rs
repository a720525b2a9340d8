//! Domain events reflecting allocation, status and publication activity.
//!
//! Every state change emits a [`StatusEvent`] through the
//! [`super::EventBus`]. Events are observational only: they are broadcast
//! to WebSocket subscribers and logged, and never feed back into control
//! flow.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::PoolId;

/// Outcome of a [`crate::service::StatusListCache`] lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListCacheEvent {
    /// Served from the cache.
    CacheHit,
    /// Loaded from the store.
    CacheMiss,
    /// Entry dropped by ordinary LRU capacity eviction.
    CacheEvicted,
    /// Entry had been dropped under memory pressure before it was needed.
    CacheSoftReferenceCleared,
}

impl ListCacheEvent {
    /// Returns the event name as a static string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CacheHit => "CACHE_HIT",
            Self::CacheMiss => "CACHE_MISS",
            Self::CacheEvicted => "CACHE_EVICTED",
            Self::CacheSoftReferenceCleared => "CACHE_SOFT_REFERENCE_CLEARED",
        }
    }
}

/// Domain event emitted after every allocation, update or publication.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A new list generation was created.
    ListCreated {
        /// Pool identifier.
        pool_id: PoolId,
        /// URI of the new list.
        list_uri: String,
        /// Number of entries.
        size: u64,
        /// Creation timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A status value was written.
    StatusUpdated {
        /// Pool identifier.
        pool_id: PoolId,
        /// List URI.
        list_uri: String,
        /// Updated index.
        index: u64,
        /// New value.
        value: u8,
        /// Update timestamp.
        timestamp: DateTime<Utc>,
    },

    /// References were handed out to a caller.
    IndicesReserved {
        /// Pool identifier.
        pool_id: PoolId,
        /// List URI.
        list_uri: String,
        /// Number of references.
        amount: u64,
        /// Timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Indices were claimed from the persistent counter into the prefetch
    /// buffer.
    IndicesTaken {
        /// Pool identifier.
        pool_id: PoolId,
        /// List URI.
        list_uri: String,
        /// Number of indices.
        amount: u64,
        /// Timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Indices were returned by `free` or at shutdown.
    IndicesFreed {
        /// Pool identifier.
        pool_id: PoolId,
        /// List URI.
        list_uri: String,
        /// Number of indices.
        amount: u64,
        /// Whether the indices may be issued again.
        reusable: bool,
        /// Timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A cache lookup for a list happened.
    ListCacheEvent {
        /// Pool identifier, when known.
        pool_id: Option<PoolId>,
        /// List URI.
        list_uri: String,
        /// Lookup outcome.
        event: ListCacheEvent,
        /// Timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A signed token was (re)published.
    ListPublished {
        /// Pool identifier.
        pool_id: PoolId,
        /// List URI.
        list_uri: String,
        /// Publication counter after the write.
        version: u64,
        /// Token expiry.
        expires_at: DateTime<Utc>,
        /// Timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl StatusEvent {
    /// Returns the pool ID associated with this event, if any.
    #[must_use]
    pub fn pool_id(&self) -> Option<&PoolId> {
        match self {
            Self::ListCreated { pool_id, .. }
            | Self::StatusUpdated { pool_id, .. }
            | Self::IndicesReserved { pool_id, .. }
            | Self::IndicesTaken { pool_id, .. }
            | Self::IndicesFreed { pool_id, .. }
            | Self::ListPublished { pool_id, .. } => Some(pool_id),
            Self::ListCacheEvent { pool_id, .. } => pool_id.as_ref(),
        }
    }

    /// Returns the event type as a static string slice.
    #[must_use]
    pub const fn event_type_str(&self) -> &'static str {
        match self {
            Self::ListCreated { .. } => "list_created",
            Self::StatusUpdated { .. } => "status_updated",
            Self::IndicesReserved { .. } => "indices_reserved",
            Self::IndicesTaken { .. } => "indices_taken",
            Self::IndicesFreed { .. } => "indices_freed",
            Self::ListCacheEvent { .. } => "list_cache_event",
            Self::ListPublished { .. } => "list_published",
        }
    }
}
