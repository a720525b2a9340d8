//! Status list service: request-level orchestration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, ServiceConfig, to_chrono};
use crate::domain::pool_entry::PoolSummary;
use crate::domain::{
    AggregationIndex, EventBus, ListId, ListRecord, PoolEntry, PoolId, PoolRegistry,
    Reference, SharedClock, StatusEvent,
};
use crate::error::ServiceError;
use crate::ledger::{ExpiringLedger, LimitedMapStorage};
use crate::persistence::SharedStore;
use crate::service::signer::Ed25519JwtSigner;
use crate::service::status_list_cache::CachedList;
use crate::service::{
    AllocatorState, IndexAllocator, PoolWriter, PrecreationScheduler, StatusListCache,
};

/// Interval of the cache cleanup task.
const CACHE_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3_600);

/// Orchestration layer behind the HTTP API.
///
/// Owns the [`PoolRegistry`], the shared [`StatusListCache`] and the
/// request ledgers. Every mutation authenticates against the owning pool,
/// delegates to the pool's workers or the store, and emits a
/// [`StatusEvent`].
#[derive(Debug)]
pub struct StatusListService {
    registry: Arc<PoolRegistry>,
    aggregations: AggregationIndex,
    cache: Arc<StatusListCache>,
    store: SharedStore,
    event_bus: EventBus,
    clock: SharedClock,
    replay: ExpiringLedger<String>,
    replay_window: chrono::Duration,
    idempotency: LimitedMapStorage<String, Vec<Reference>>,
    /// Idempotency keys with a reservation in flight.
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StatusListService {
    /// Registers `pools` with the store and wires up their workers.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] for duplicate pools, invalid signer
    /// keys or pools stored with a different shape, and the store error if
    /// the store cannot be reached.
    pub async fn build(
        config: &ServiceConfig,
        pools: Vec<PoolConfig>,
        store: SharedStore,
        event_bus: EventBus,
        clock: SharedClock,
    ) -> Result<Self, ServiceError> {
        let aggregations = AggregationIndex::from_pools(
            pools
                .iter()
                .map(|p| (&p.id, p.aggregation_id.as_deref())),
        );
        let cache = Arc::new(StatusListCache::new(
            config.cache_capacity,
            to_chrono(config.cache_ttl),
            to_chrono(config.cache_duration),
            Arc::clone(&store),
            event_bus.clone(),
            Arc::clone(&clock),
        )
        .with_max_bytes(config.cache_max_bytes));
        let holder = uuid::Uuid::new_v4().simple().to_string();
        let registry = Arc::new(PoolRegistry::new());

        for pool in pools {
            pool.validate()?;
            store
                .create_or_verify_pool(&pool.id, pool.size, pool.bits)
                .await?;
            let signer = Arc::new(Ed25519JwtSigner::from_config(&pool.signer)?);
            let aggregation_uri = aggregations.aggregation_uri(&pool.id, &config.public_url);
            let pool = Arc::new(pool);

            let writer = Arc::new(PoolWriter::new(
                Arc::clone(&pool),
                Arc::clone(&store),
                signer,
                Arc::clone(&cache),
                event_bus.clone(),
                Arc::clone(&clock),
                aggregation_uri,
                holder.as_str(),
            ));
            let precreation = Arc::new(PrecreationScheduler::new(
                Arc::clone(&pool),
                Arc::clone(&store),
                Arc::clone(&writer),
                event_bus.clone(),
                Arc::clone(&clock),
                config.public_url.as_str(),
                holder.as_str(),
            ));
            let allocator = Arc::new(IndexAllocator::new(
                Arc::clone(&pool),
                Arc::clone(&store),
                Arc::clone(&precreation),
                event_bus.clone(),
                Arc::clone(&clock),
                config.store_timeout,
            ));
            registry
                .insert(PoolEntry {
                    config: Arc::clone(&pool),
                    allocator,
                    writer,
                    precreation,
                })
                .await?;
            info!(pool_id = %pool.id, size = pool.size, bits = pool.bits, "pool registered");
        }

        Ok(Self {
            registry,
            aggregations,
            cache,
            store,
            event_bus,
            replay: ExpiringLedger::new(config.replay_capacity, Arc::clone(&clock)),
            replay_window: to_chrono(config.replay_window),
            idempotency: LimitedMapStorage::new(
                config.idempotency_limit,
                to_chrono(config.idempotency_max_age),
                Arc::clone(&clock),
            ),
            in_flight: Mutex::new(HashMap::new()),
            clock,
        })
    }

    /// Returns a reference to the inner [`EventBus`].
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Returns a reference to the inner [`PoolRegistry`].
    #[must_use]
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Returns the shared token cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<StatusListCache> {
        &self.cache
    }

    fn authenticate(entry: &PoolEntry, api_key: Option<&str>) -> Result<(), ServiceError> {
        let Some(api_key) = api_key else {
            return Err(ServiceError::Unauthorized("missing X-Api-Key".to_string()));
        };
        if !entry.accepts_key(api_key) {
            return Err(ServiceError::Unauthorized(format!(
                "key not accepted for pool {}",
                entry.pool_id()
            )));
        }
        Ok(())
    }

    /// Reserves `amount` references from a pool.
    ///
    /// A retry carrying the same `idempotency_key` within the idempotency
    /// window returns the references of the first call. Concurrent calls
    /// with the same key are serialized, so only one of them allocates.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::PoolNotFound`], [`ServiceError::Unauthorized`]
    /// or any error of [`IndexAllocator::reserve`].
    pub async fn reserve(
        &self,
        pool_id: &PoolId,
        amount: u64,
        api_key: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<Vec<Reference>, ServiceError> {
        let entry = self.registry.get(pool_id).await?;
        Self::authenticate(&entry, api_key)?;

        let Some(key) = idempotency_key.map(|key| format!("{pool_id}:{key}")) else {
            return entry.allocator.reserve(amount).await;
        };
        let gate = Arc::clone(
            self.in_flight
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );
        let result = {
            let _held = gate.lock().await;
            if let Some(references) = self.idempotency.get(&key) {
                debug!(%pool_id, "replaying idempotent reservation");
                Ok(references)
            } else {
                let result = entry.allocator.reserve(amount).await;
                if let Ok(references) = &result {
                    self.idempotency.set(key.clone(), references.clone());
                }
                result
            }
        };

        let mut in_flight = self.in_flight.lock();
        // Only the map and this call still hold the gate.
        if Arc::strong_count(&gate) == 2 {
            in_flight.remove(&key);
        }
        result
    }

    async fn resolve(&self, uri: &str) -> Result<(ListRecord, Arc<PoolEntry>), ServiceError> {
        let list_id = ListId::from_uri(uri)?;
        let record = self
            .store
            .list(list_id)
            .await?
            .filter(|record| record.uri == uri)
            .ok_or_else(|| ServiceError::ListNotFound(uri.to_string()))?;
        let entry = self.registry.get(&record.pool_id).await?;
        Ok((record, entry))
    }

    /// Writes the status value of an issued reference.
    ///
    /// `request_id` is replay-checked: the same id is rejected until the
    /// replay window has passed. An id is only consumed by a request that
    /// passed validation; if the store write then fails, the id is released
    /// so the caller can retry with it.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::ListNotFound`] for an unknown list URI.
    /// - [`ServiceError::Unauthorized`] without a key of the owning pool.
    /// - [`ServiceError::OutOfRange`] / [`ServiceError::ValueOutOfRange`].
    /// - [`ServiceError::UnknownReference`] for an index never handed out.
    /// - [`ServiceError::ReplayedRequest`] for a repeated `request_id`.
    /// - The store error if the write fails.
    pub async fn update_status(
        &self,
        reference: &Reference,
        value: u8,
        api_key: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<(), ServiceError> {
        let (record, entry) = self.resolve(&reference.uri).await?;
        Self::authenticate(&entry, api_key)?;

        if reference.index >= record.size {
            return Err(ServiceError::OutOfRange {
                index: reference.index,
                size: record.size,
            });
        }
        if u32::from(value) >> record.bits != 0 {
            return Err(ServiceError::ValueOutOfRange {
                value,
                bits: record.bits,
            });
        }
        if reference.index >= record.claimed {
            return Err(ServiceError::UnknownReference {
                uri: reference.uri.clone(),
                index: reference.index,
            });
        }

        let replay_key = request_id.map(|id| format!("{}:{id}", record.pool_id));
        if let (Some(key), Some(request_id)) = (&replay_key, request_id)
            && !self
                .replay
                .is_unused(key.clone(), self.clock.now() + self.replay_window)
        {
            return Err(ServiceError::ReplayedRequest(request_id.to_string()));
        }

        let version = match self
            .store
            .update_status(record.list_id, reference.index, value)
            .await
        {
            Ok(version) => version,
            Err(e) => {
                if let Some(key) = &replay_key {
                    self.replay.forget(key);
                }
                warn!(pool_id = %record.pool_id, list_uri = %record.uri, error = %e, "status update failed");
                return Err(e);
            }
        };
        info!(
            pool_id = %record.pool_id,
            list_uri = %record.uri,
            index = reference.index,
            value,
            version,
            "status updated"
        );
        let _ = self.event_bus.publish(StatusEvent::StatusUpdated {
            pool_id: record.pool_id,
            list_uri: record.uri,
            index: reference.index,
            value,
            timestamp: self.clock.now(),
        });
        Ok(())
    }

    /// Releases an issued reference according to its pool's reuse policy.
    ///
    /// # Errors
    ///
    /// See [`IndexAllocator::free`]; additionally
    /// [`ServiceError::Unauthorized`] without a key of the owning pool.
    pub async fn free(
        &self,
        reference: &Reference,
        api_key: Option<&str>,
    ) -> Result<(), ServiceError> {
        let (_, entry) = self.resolve(&reference.uri).await.map_err(|e| match e {
            ServiceError::ListNotFound(_) => ServiceError::UnknownReference {
                uri: reference.uri.clone(),
                index: reference.index,
            },
            other => other,
        })?;
        Self::authenticate(&entry, api_key)?;
        entry.allocator.free(reference).await
    }

    /// Published token of a list.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ListNotFound`] if the list does not exist or
    /// was never published.
    pub async fn token(&self, list_id: ListId) -> Result<Arc<CachedList>, ServiceError> {
        self.cache.get(list_id).await
    }

    /// Published status value of one reference, read through the cache.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ListNotFound`] for an unknown or unpublished
    /// list and [`ServiceError::OutOfRange`] for an index past its end.
    pub async fn status(&self, reference: &Reference) -> Result<u8, ServiceError> {
        let cached = self.cache.get(ListId::from_uri(&reference.uri)?).await?;
        if cached.uri != reference.uri {
            return Err(ServiceError::ListNotFound(reference.uri.clone()));
        }
        cached.list.get(reference.index)
    }

    /// URIs of every list of every pool in an aggregation.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ListNotFound`] for an unknown aggregation.
    pub async fn aggregation(&self, aggregation_id: &str) -> Result<Vec<String>, ServiceError> {
        let pools = self
            .aggregations
            .pools(aggregation_id)
            .ok_or_else(|| ServiceError::ListNotFound(format!("aggregation {aggregation_id}")))?;
        let mut uris = Vec::new();
        for pool_id in pools {
            uris.extend(
                self.store
                    .all_lists(pool_id)
                    .await?
                    .into_iter()
                    .map(|record| record.uri),
            );
        }
        Ok(uris)
    }

    /// Summaries of all configured pools.
    pub async fn pools(&self) -> Vec<PoolSummary> {
        self.registry.list().await
    }

    /// Allocation state of one pool.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::PoolNotFound`] or the allocator's store
    /// error.
    pub async fn pool_state(&self, pool_id: &PoolId) -> Result<AllocatorState, ServiceError> {
        self.registry.get(pool_id).await?.allocator.state().await
    }

    /// Spawns the per-pool writer and precreation tasks and the cache
    /// cleanup task. All stop once `shutdown` flips to `true`.
    pub async fn spawn_workers(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for entry in self.registry.entries().await {
            handles.push(tokio::spawn(
                Arc::clone(&entry.writer).run(shutdown.clone()),
            ));
            handles.push(tokio::spawn(
                Arc::clone(&entry.precreation).run(shutdown.clone()),
            ));
        }

        let cache = Arc::clone(&self.cache);
        let mut cleanup_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = cache.clear_unused();
                    }
                    changed = cleanup_shutdown.changed() => {
                        if changed.is_err() || *cleanup_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
        handles
    }

    /// Returns every allocator's buffered indices to the store.
    pub async fn shutdown(&self) {
        for entry in self.registry.entries().await {
            if let Err(e) = entry.allocator.shutdown().await {
                warn!(pool_id = %entry.pool_id(), error = %e, "failed to return buffered indices");
            }
        }
    }
}
