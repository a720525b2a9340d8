//! In-process cache of published status list tokens.
//!
//! Serves `GET /{list_id}` and internal status reads without a store round
//! trip on every request. Every lookup reports its outcome as a
//! [`ListCacheEvent`] on the [`EventBus`].

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use crate::domain::status_list::StatusList;
use crate::domain::token::StatusListClaims;
use crate::domain::{
    EventBus, ListCacheEvent, ListId, ListStorageMetadata, PoolId, SharedClock, StatusEvent,
};
use crate::error::ServiceError;
use crate::persistence::SharedStore;

/// A published token together with its decoded list.
#[derive(Debug)]
pub struct CachedList {
    /// List identifier.
    pub list_id: ListId,
    /// Public URI of the list.
    pub uri: String,
    /// Owning pool.
    pub pool_id: PoolId,
    /// Serialized token as published.
    pub token: String,
    /// Publication metadata of `token`.
    pub metadata: ListStorageMetadata,
    /// List decoded from the token's `lst` claim.
    pub list: StatusList,
}

impl CachedList {
    /// Approximate heap size of the entry in bytes.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.token.len() + self.list.as_bytes().len() + self.uri.len()
    }

    /// Strong ETag derived from the publication version.
    #[must_use]
    pub fn etag(&self) -> String {
        format!("\"{}-{}\"", self.list_id, self.metadata.version)
    }
}

#[derive(Debug)]
struct CacheEntry {
    list: Arc<CachedList>,
    loaded_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<ListId, CacheEntry>,
    /// Sum of the footprints of `entries`.
    bytes: usize,
    /// Keys dropped under memory pressure and not looked up since.
    soft_cleared: HashSet<ListId>,
}

impl CacheState {
    fn remove(&mut self, list_id: &ListId) -> Option<CacheEntry> {
        let entry = self.entries.pop(list_id)?;
        self.bytes = self.bytes.saturating_sub(entry.list.footprint());
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<ListId> {
        let (list_id, entry) = self.entries.pop_lru()?;
        self.bytes = self.bytes.saturating_sub(entry.list.footprint());
        self.soft_cleared.insert(list_id);
        Some(list_id)
    }
}

/// LRU cache of [`CachedList`]s keyed by list id.
///
/// Entries are served for `ttl` after loading. Ordinary capacity eviction
/// emits `CACHE_EVICTED`. Entries dropped by
/// [`StatusListCache::relieve_memory_pressure`] are remembered so the next
/// lookup reports `CACHE_SOFT_REFERENCE_CLEARED` before its `CACHE_MISS`,
/// telling a too large working set apart from normal turnover. The same
/// happens automatically once the cached lists exceed the byte budget set
/// with [`StatusListCache::with_max_bytes`].
#[derive(Debug)]
pub struct StatusListCache {
    state: Mutex<CacheState>,
    max_bytes: Option<usize>,
    store: SharedStore,
    event_bus: EventBus,
    clock: SharedClock,
    ttl: Duration,
    cache_duration: Duration,
}

impl StatusListCache {
    /// Creates a cache holding at most `capacity` lists (minimum one).
    #[must_use]
    pub fn new(
        capacity: usize,
        ttl: Duration,
        cache_duration: Duration,
        store: SharedStore,
        event_bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                bytes: 0,
                soft_cleared: HashSet::new(),
            }),
            max_bytes: None,
            store,
            event_bus,
            clock,
            ttl,
            cache_duration,
        }
    }

    /// Caps the approximate memory used by cached lists; `0` means no cap.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = (max_bytes > 0).then_some(max_bytes);
        self
    }

    fn emit(&self, list_id: ListId, uri: &str, pool_id: Option<PoolId>, event: ListCacheEvent) {
        tracing::trace!(%list_id, event = event.as_str(), "status list cache");
        let _ = self.event_bus.publish(StatusEvent::ListCacheEvent {
            pool_id,
            list_uri: uri.to_string(),
            event,
            timestamp: self.clock.now(),
        });
    }

    /// Returns the published token of `list_id`, loading it on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ListNotFound`] if the list does not exist or
    /// has not been published yet, or the store error on load failure.
    pub async fn get(&self, list_id: ListId) -> Result<Arc<CachedList>, ServiceError> {
        let now = self.clock.now();
        let soft_cleared = {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get_mut(&list_id)
                && now < entry.loaded_at + self.ttl
            {
                entry.accessed_at = now;
                let list = Arc::clone(&entry.list);
                drop(state);
                self.emit(list_id, &list.uri, Some(list.pool_id.clone()), ListCacheEvent::CacheHit);
                return Ok(list);
            }
            state.soft_cleared.remove(&list_id)
        };

        let cached = Arc::new(self.load(list_id).await?);
        if soft_cleared {
            self.emit(
                list_id,
                &cached.uri,
                Some(cached.pool_id.clone()),
                ListCacheEvent::CacheSoftReferenceCleared,
            );
        }
        self.emit(list_id, &cached.uri, Some(cached.pool_id.clone()), ListCacheEvent::CacheMiss);

        let evicted = {
            let mut state = self.state.lock();
            state.bytes += cached.footprint();
            let evicted = state.entries.push(
                list_id,
                CacheEntry {
                    list: Arc::clone(&cached),
                    loaded_at: now,
                    accessed_at: now,
                },
            );
            if let Some((_, entry)) = &evicted {
                state.bytes = state.bytes.saturating_sub(entry.list.footprint());
            }
            evicted
        };
        self.enforce_budget();
        if let Some((evicted_id, entry)) = evicted
            && evicted_id != list_id
        {
            self.emit(
                evicted_id,
                &entry.list.uri,
                Some(entry.list.pool_id.clone()),
                ListCacheEvent::CacheEvicted,
            );
        }
        Ok(cached)
    }

    async fn load(&self, list_id: ListId) -> Result<CachedList, ServiceError> {
        let not_found = || ServiceError::ListNotFound(list_id.to_string());
        let record = self.store.list(list_id).await?.ok_or_else(not_found)?;
        let stored = self.store.load_token(list_id).await?.ok_or_else(not_found)?;
        let token = String::from_utf8(stored.bytes)
            .map_err(|e| ServiceError::Internal(format!("stored token is not UTF-8: {e}")))?;
        let list = StatusListClaims::from_compact(&token)?.decode_list_sized(record.size)?;
        Ok(CachedList {
            list_id,
            uri: record.uri,
            pool_id: record.pool_id,
            token,
            metadata: stored.metadata,
            list,
        })
    }

    /// Drops `list_id` so the next lookup reloads it.
    pub fn invalidate(&self, list_id: ListId) {
        self.state.lock().remove(&list_id);
    }

    /// Evicts least recently used entries until at most `keep` remain.
    ///
    /// Returns the number of dropped entries.
    pub fn relieve_memory_pressure(&self, keep: usize) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        while state.entries.len() > keep && state.pop_lru().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::info!(dropped, keep, "status list cache shrunk under memory pressure");
        }
        dropped
    }

    /// Drops least recently used entries while the cache is over its byte
    /// budget. The most recent entry always stays.
    fn enforce_budget(&self) {
        let Some(max_bytes) = self.max_bytes else {
            return;
        };
        let mut state = self.state.lock();
        let mut dropped = 0;
        while state.bytes > max_bytes && state.entries.len() > 1 && state.pop_lru().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::info!(dropped, bytes = state.bytes, max_bytes, "status list cache over its memory budget");
        }
    }

    /// Approximate memory held by cached lists in bytes.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Drops entries not accessed within the configured cache duration.
    ///
    /// Returns the number of dropped entries.
    pub fn clear_unused(&self) -> usize {
        let cutoff = self.clock.now() - self.cache_duration;
        let mut state = self.state.lock();
        let stale: Vec<ListId> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.accessed_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for list_id in &stale {
            state.remove(list_id);
        }
        state.soft_cleared.clear();
        if !stale.is_empty() {
            tracing::debug!(cleared = stale.len(), "cleared unused status list cache entries");
        }
        stale.len()
    }

    /// Number of cached lists.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
