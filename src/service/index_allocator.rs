//! Per-pool index allocation.
//!
//! [`IndexAllocator`] hands out `(list uri, index)` references from an
//! in-memory prefetch buffer that is filled by atomic batch claims against
//! the store's per-list counter. The counter is the single source of
//! truth: an index enters a buffer only after the store committed its
//! claim, so two allocators (in one or many processes) can never hand out
//! the same index. A crash loses the buffer, which only wastes indices.
//!
//! Indices are marked issued in the store just before they leave the
//! buffer, so a release is only accepted for an index some caller actually
//! holds, whichever instance handed it out.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::{PoolConfig, ReusePolicy, UnderflowPolicy};
use crate::domain::{
    EventBus, ListId, ListRecord, ListState, Reference, Release, SharedClock, StatusEvent,
};
use crate::error::ServiceError;
use crate::persistence::SharedStore;
use crate::service::precreation::PrecreationScheduler;

/// Largest number of references a single request may reserve.
pub const MAX_RESERVE: u64 = 100_000;

/// Synchronous list creations a reservation may make beyond the lists its
/// amount needs, to absorb lists drained concurrently by other instances.
const EXTRA_CREATE_ROUNDS: u64 = 3;

/// Coarse allocation state of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorState {
    /// No list was ever created for the pool.
    NeedsList,
    /// Indices are available.
    Active,
    /// Fewer than `prefetch.threshold` indices are left.
    NearExhaustion,
    /// Every list is used up; the next reservation creates one.
    Exhausted,
}

#[derive(Debug, Clone)]
struct BufferedIndex {
    list_id: ListId,
    uri: Arc<str>,
    index: u64,
}

impl BufferedIndex {
    fn reference(&self) -> Reference {
        Reference::new(self.uri.as_ref(), self.index)
    }
}

/// Prefetching allocator of one pool.
#[derive(Debug)]
pub struct IndexAllocator {
    pool: Arc<PoolConfig>,
    store: SharedStore,
    precreation: Arc<PrecreationScheduler>,
    event_bus: EventBus,
    clock: SharedClock,
    store_timeout: Duration,
    buffer: Mutex<VecDeque<BufferedIndex>>,
    refilling: AtomicBool,
}

impl IndexAllocator {
    /// Creates an allocator with an empty buffer.
    ///
    /// Every store call is bounded by `store_timeout`.
    #[must_use]
    pub fn new(
        pool: Arc<PoolConfig>,
        store: SharedStore,
        precreation: Arc<PrecreationScheduler>,
        event_bus: EventBus,
        clock: SharedClock,
        store_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            store,
            precreation,
            event_bus,
            clock,
            store_timeout,
            buffer: Mutex::new(VecDeque::new()),
            refilling: AtomicBool::new(false),
        }
    }

    /// Pool this allocator serves.
    #[must_use]
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Number of claimed indices waiting in the buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ServiceError::Persistence(msg))) => Err(ServiceError::AllocationUnavailable(
                format!("{operation}: {msg}"),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ServiceError::AllocationUnavailable(format!(
                "{operation} timed out after {} ms",
                self.store_timeout.as_millis()
            ))),
        }
    }

    /// Hands out `amount` distinct references.
    ///
    /// Served from the buffer when possible, otherwise by claiming from the
    /// store. With `on_underflow = fail` an insufficient buffer is an error
    /// instead of a synchronous claim.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::InvalidRequest`] if `amount` is zero or above
    ///   [`MAX_RESERVE`].
    /// - [`ServiceError::PrefetchUnderflow`] under the `fail` policy.
    /// - [`ServiceError::AllocationUnavailable`] if the store cannot be
    ///   reached in time.
    pub async fn reserve(self: &Arc<Self>, amount: u64) -> Result<Vec<Reference>, ServiceError> {
        if amount == 0 || amount > MAX_RESERVE {
            return Err(ServiceError::InvalidRequest(format!(
                "amount must be between 1 and {MAX_RESERVE}"
            )));
        }
        let wanted = usize::try_from(amount)
            .map_err(|_| ServiceError::InvalidRequest(format!("amount {amount} too large")))?;

        let mut taken = self.pop(wanted);
        if taken.len() < wanted {
            if self.pool.prefetch.on_underflow == UnderflowPolicy::Fail {
                debug!(pool_id = %self.pool.id, buffered = taken.len(), amount, "prefetch buffer short");
                self.push_front(taken);
                self.spawn_refill();
                return Err(ServiceError::PrefetchUnderflow(self.pool.id.to_string()));
            }
            debug!(pool_id = %self.pool.id, buffered = taken.len(), amount, "prefetch buffer short, claiming synchronously");
            let missing = wanted - taken.len();
            match self.claim(missing, self.pool.prefetch.capacity).await {
                Ok(claimed) => taken.extend(claimed),
                Err(e) => {
                    self.push_front(taken);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.mark_issued(&taken).await {
            // Some of them may already count as issued; dropping wastes them
            // but never hands one out twice.
            warn!(pool_id = %self.pool.id, dropped = taken.len(), error = %e, "failed to mark references issued");
            return Err(e);
        }
        self.after_serve(&taken);
        Ok(taken.iter().map(BufferedIndex::reference).collect())
    }

    fn pop(&self, wanted: usize) -> Vec<BufferedIndex> {
        let mut buffer = self.buffer.lock();
        let n = wanted.min(buffer.len());
        buffer.drain(..n).collect()
    }

    fn push_front(&self, indices: Vec<BufferedIndex>) {
        let mut buffer = self.buffer.lock();
        for index in indices.into_iter().rev() {
            buffer.push_front(index);
        }
    }

    async fn mark_issued(&self, served: &[BufferedIndex]) -> Result<(), ServiceError> {
        for (list_id, indices) in group_by_list(served) {
            self.bounded("mark_issued", self.store.mark_issued(list_id, &indices))
                .await?;
        }
        Ok(())
    }

    fn after_serve(self: &Arc<Self>, served: &[BufferedIndex]) {
        let mut per_list: BTreeMap<&str, u64> = BTreeMap::new();
        for index in served {
            *per_list.entry(index.uri.as_ref()).or_default() += 1;
        }
        let now = self.clock.now();
        for (uri, amount) in per_list {
            let _ = self.event_bus.publish(StatusEvent::IndicesReserved {
                pool_id: self.pool.id.clone(),
                list_uri: uri.to_string(),
                amount,
                timestamp: now,
            });
        }

        let buffered = self.buffered() as u64;
        if buffered < self.pool.prefetch.threshold {
            self.spawn_refill();
        }
    }

    fn spawn_refill(self: &Arc<Self>) {
        if self.refilling.swap(true, Ordering::AcqRel) {
            return;
        }
        let allocator = Arc::clone(self);
        tokio::spawn(async move {
            match allocator.refill().await {
                Ok(0) => {}
                Ok(claimed) => {
                    debug!(pool_id = %allocator.pool.id, claimed, "prefetch buffer refilled");
                }
                Err(e) => warn!(pool_id = %allocator.pool.id, error = %e, "prefetch refill failed"),
            }
            allocator.refilling.store(false, Ordering::Release);
        });
    }

    /// Tops the buffer up to `prefetch.capacity` and returns the number of
    /// added indices.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AllocationUnavailable`] if the store cannot
    /// be reached in time.
    pub async fn refill(&self) -> Result<usize, ServiceError> {
        let capacity = usize::try_from(self.pool.prefetch.capacity).unwrap_or(usize::MAX);
        let buffered = self.buffered();
        if buffered >= capacity {
            return Ok(0);
        }
        let claimed = self.claim(capacity - buffered, 0).await?;
        let added = claimed.len();
        self.buffer.lock().extend(claimed);
        Ok(added)
    }

    /// Claims exactly `wanted` indices. Each store claim asks for at least
    /// `min_batch`; the surplus goes to the back of the buffer.
    async fn claim(&self, wanted: usize, min_batch: u64) -> Result<Vec<BufferedIndex>, ServiceError> {
        let mut out = Vec::with_capacity(wanted);
        if let Err(e) = self.claim_into(&mut out, wanted, min_batch).await {
            // Committed claims stay usable even if the request fails.
            if !out.is_empty() {
                self.buffer.lock().extend(out);
            }
            return Err(e);
        }
        Ok(out)
    }

    async fn claim_into(
        &self,
        out: &mut Vec<BufferedIndex>,
        wanted: usize,
        min_batch: u64,
    ) -> Result<(), ServiceError> {
        let needed_lists = (wanted as u64).div_ceil(self.pool.size.max(1));
        let max_rounds = needed_lists + EXTRA_CREATE_ROUNDS;
        let mut rounds = 0;
        loop {
            let lists = self
                .bounded("current_lists", self.store.current_lists(&self.pool.id))
                .await?;
            for record in lists {
                if out.len() >= wanted {
                    return Ok(());
                }
                self.claim_from(&record, out, wanted, min_batch).await?;
            }
            if out.len() >= wanted {
                return Ok(());
            }

            rounds += 1;
            if rounds > max_rounds {
                return Err(ServiceError::AllocationUnavailable(format!(
                    "pool {} has no allocatable list",
                    self.pool.id
                )));
            }
            warn!(pool_id = %self.pool.id, "prefetch underflow, every active list is used up");
            self.bounded("create_list", self.precreation.create_now())
                .await?;
        }
    }

    async fn claim_from(
        &self,
        record: &ListRecord,
        out: &mut Vec<BufferedIndex>,
        wanted: usize,
        min_batch: u64,
    ) -> Result<(), ServiceError> {
        if !record.is_allocatable(self.clock.now()) {
            return self.freeze(record).await;
        }
        let uri: Arc<str> = Arc::from(record.uri.as_str());
        let buffered = |index: u64| BufferedIndex {
            list_id: record.list_id,
            uri: Arc::clone(&uri),
            index,
        };

        let missing = (wanted - out.len()) as u64;
        let freed = self
            .bounded("take_freed", self.store.take_freed(record.list_id, missing))
            .await?;
        if !freed.is_empty() {
            debug!(pool_id = %self.pool.id, list_uri = %record.uri, count = freed.len(), "reusing freed indices");
        }
        out.extend(freed.into_iter().map(buffered));

        let missing = wanted - out.len();
        if missing == 0 {
            return Ok(());
        }
        let batch = (missing as u64).max(min_batch);
        let claim = self
            .bounded("claim_batch", self.store.claim_batch(record.list_id, batch))
            .await?;
        if claim.count == 0 {
            return self.freeze(record).await;
        }

        let _ = self.event_bus.publish(StatusEvent::IndicesTaken {
            pool_id: self.pool.id.clone(),
            list_uri: record.uri.clone(),
            amount: claim.count,
            timestamp: self.clock.now(),
        });
        let mut indices = claim.indices().map(buffered);
        out.extend(indices.by_ref().take(missing));
        self.buffer.lock().extend(indices);

        let remaining = record.size.saturating_sub(claim.start + claim.count);
        if remaining < self.pool.prefetch.threshold {
            debug!(pool_id = %self.pool.id, list_uri = %record.uri, remaining, "list near exhaustion, waking precreation");
            self.precreation.wake();
        }
        Ok(())
    }

    async fn freeze(&self, record: &ListRecord) -> Result<(), ServiceError> {
        self.bounded(
            "set_list_state",
            self.store.set_list_state(record.list_id, ListState::Frozen),
        )
        .await?;
        info!(pool_id = %self.pool.id, list_uri = %record.uri, claimed = record.claimed, "list frozen");
        self.precreation.wake();
        Ok(())
    }

    /// Releases an issued reference.
    ///
    /// The store accepts the release only while the index is issued, which
    /// rules out indices still buffered by any instance and repeated
    /// releases. Under [`ReusePolicy::Retire`] the index is never issued
    /// again. Under [`ReusePolicy::Reuse`] it returns to the store's freed
    /// set once; a reissued index is retired when released again.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownReference`] if the reference is not
    /// currently issued from this pool, or
    /// [`ServiceError::AllocationUnavailable`] if the store cannot be
    /// reached.
    pub async fn free(&self, reference: &Reference) -> Result<(), ServiceError> {
        let unknown = || ServiceError::UnknownReference {
            uri: reference.uri.clone(),
            index: reference.index,
        };
        let list_id = ListId::from_uri(&reference.uri).map_err(|_| unknown())?;
        let record = self
            .bounded("list", self.store.list(list_id))
            .await?
            .ok_or_else(unknown)?;
        if record.pool_id != self.pool.id || record.uri != reference.uri {
            return Err(unknown());
        }

        let reusable = self.pool.reuse_policy == ReusePolicy::Reuse;
        let Some(release) = self
            .bounded(
                "free_issued",
                self.store.free_issued(list_id, reference.index, reusable),
            )
            .await?
        else {
            warn!(pool_id = %self.pool.id, list_uri = %reference.uri, index = reference.index, "release of a reference that is not issued");
            return Err(unknown());
        };
        let reusable = release == Release::Reusable;
        debug!(pool_id = %self.pool.id, list_uri = %reference.uri, index = reference.index, reusable, "reference freed");
        let _ = self.event_bus.publish(StatusEvent::IndicesFreed {
            pool_id: self.pool.id.clone(),
            list_uri: reference.uri.clone(),
            amount: 1,
            reusable,
            timestamp: self.clock.now(),
        });
        Ok(())
    }

    /// Reports the pool's allocation state.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AllocationUnavailable`] if the store cannot
    /// be reached.
    pub async fn state(&self) -> Result<AllocatorState, ServiceError> {
        let now = self.clock.now();
        let active = self
            .bounded("current_lists", self.store.current_lists(&self.pool.id))
            .await?;
        let remaining: u64 = active
            .iter()
            .filter(|r| r.is_allocatable(now))
            .map(ListRecord::remaining)
            .sum::<u64>()
            + self.buffered() as u64;

        if remaining == 0 {
            let all = self
                .bounded("all_lists", self.store.all_lists(&self.pool.id))
                .await?;
            return Ok(if all.is_empty() {
                AllocatorState::NeedsList
            } else {
                AllocatorState::Exhausted
            });
        }
        Ok(if remaining < self.pool.prefetch.threshold {
            AllocatorState::NearExhaustion
        } else {
            AllocatorState::Active
        })
    }

    /// Returns every buffered, never issued index to the store's freed set
    /// and reports how many were returned.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AllocationUnavailable`] if the store cannot
    /// be reached; the affected indices are lost, never duplicated.
    pub async fn shutdown(&self) -> Result<usize, ServiceError> {
        let drained: Vec<BufferedIndex> = self.buffer.lock().drain(..).collect();
        let uris: BTreeMap<ListId, Arc<str>> = drained
            .iter()
            .map(|b| (b.list_id, Arc::clone(&b.uri)))
            .collect();

        let now = self.clock.now();
        for (list_id, indices) in group_by_list(&drained) {
            self.bounded(
                "return_unissued",
                self.store.return_unissued(list_id, &indices),
            )
            .await?;
            let _ = self.event_bus.publish(StatusEvent::IndicesFreed {
                pool_id: self.pool.id.clone(),
                list_uri: uris.get(&list_id).map(ToString::to_string).unwrap_or_default(),
                amount: indices.len() as u64,
                reusable: true,
                timestamp: now,
            });
        }
        if !drained.is_empty() {
            info!(pool_id = %self.pool.id, returned = drained.len(), "returned buffered indices");
        }
        Ok(drained.len())
    }
}

fn group_by_list(indices: &[BufferedIndex]) -> BTreeMap<ListId, Vec<u64>> {
    let mut per_list: BTreeMap<ListId, Vec<u64>> = BTreeMap::new();
    for index in indices {
        per_list.entry(index.list_id).or_default().push(index.index);
    }
    per_list
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashSet;

    use chrono::Utc;

    use super::*;
    use crate::config::SignerConfig;
    use crate::domain::{ManualClock, PoolId};
    use crate::persistence::{MemoryStore, StatusStore};
    use crate::service::StatusListCache;
    use crate::service::pool_writer::PoolWriter;
    use crate::service::signer::Ed25519JwtSigner;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        pool: Arc<PoolConfig>,
        bus: EventBus,
    }

    impl Fixture {
        fn new(size: u64, bits: u8, configure: impl FnOnce(&mut PoolConfig)) -> Self {
            let clock = ManualClock::new(Utc::now());
            let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
            let Ok(pool_id) = PoolId::new("alloc") else {
                panic!("valid pool id");
            };
            let signer = SignerConfig {
                key_seed: String::new(),
                kid: None,
            };
            let mut pool = PoolConfig::new(pool_id, size, bits, "https://issuer.example", signer);
            pool.prefetch.capacity = 4;
            pool.prefetch.threshold = 2;
            configure(&mut pool);
            Self {
                store,
                clock,
                pool: Arc::new(pool),
                bus: EventBus::new(256),
            }
        }

        fn allocator(&self) -> Arc<IndexAllocator> {
            let clock: SharedClock = Arc::new(self.clock.clone());
            let store: SharedStore = Arc::clone(&self.store) as SharedStore;
            let cache = Arc::new(StatusListCache::new(
                4,
                chrono::Duration::seconds(60),
                chrono::Duration::hours(1),
                Arc::clone(&store),
                self.bus.clone(),
                Arc::clone(&clock),
            ));
            let writer = Arc::new(PoolWriter::new(
                Arc::clone(&self.pool),
                Arc::clone(&store),
                Arc::new(Ed25519JwtSigner::new(&[1u8; 32], None)),
                cache,
                self.bus.clone(),
                Arc::clone(&clock),
                None,
                "test",
            ));
            let precreation = Arc::new(PrecreationScheduler::new(
                Arc::clone(&self.pool),
                Arc::clone(&store),
                writer,
                self.bus.clone(),
                Arc::clone(&clock),
                "https://status.example.com",
                "test",
            ));
            Arc::new(IndexAllocator::new(
                Arc::clone(&self.pool),
                store,
                precreation,
                self.bus.clone(),
                clock,
                Duration::from_secs(1),
            ))
        }
    }

    async fn reserve_one(allocator: &Arc<IndexAllocator>) -> Reference {
        let Ok(refs) = allocator.reserve(1).await else {
            panic!("reserve should succeed");
        };
        let Some(reference) = refs.into_iter().next() else {
            panic!("one reference expected");
        };
        reference
    }

    #[tokio::test]
    async fn reserves_distinct_references_and_buffers_surplus() {
        let fx = Fixture::new(64, 1, |_| {});
        let allocator = fx.allocator();
        let Ok(first) = allocator.reserve(3).await else {
            panic!("reserve should succeed");
        };
        assert_eq!(first.len(), 3);
        let Ok(second) = allocator.reserve(1).await else {
            panic!("reserve should succeed");
        };
        let indices: HashSet<u64> = first.iter().chain(&second).map(|r| r.index).collect();
        assert_eq!(indices.len(), 4);
    }

    #[tokio::test]
    async fn two_allocators_on_one_store_never_collide() {
        let fx = Fixture::new(64, 1, |_| {});
        let a = fx.allocator();
        let b = fx.allocator();
        let mut seen = HashSet::new();
        for _ in 0..10 {
            for allocator in [&a, &b] {
                let Ok(refs) = allocator.reserve(3).await else {
                    panic!("reserve should succeed");
                };
                for r in refs {
                    assert!(seen.insert(r), "reference handed out twice");
                }
            }
        }
    }

    #[tokio::test]
    async fn spills_into_second_generation() {
        let fx = Fixture::new(128, 2, |p| p.prefetch.capacity = 100);
        let allocator = fx.allocator();
        let Ok(refs) = allocator.reserve(130).await else {
            panic!("reserve should succeed");
        };
        assert_eq!(refs.len(), 130);
        let uris: HashSet<&str> = refs.iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(uris.len(), 2);
        let unique: HashSet<&Reference> = refs.iter().collect();
        assert_eq!(unique.len(), 130);
    }

    #[tokio::test]
    async fn fail_policy_reports_underflow() {
        let fx = Fixture::new(64, 1, |p| p.prefetch.on_underflow = UnderflowPolicy::Fail);
        let allocator = fx.allocator();
        assert!(matches!(
            allocator.reserve(1).await,
            Err(ServiceError::PrefetchUnderflow(_))
        ));
    }

    #[tokio::test]
    async fn outage_is_allocation_unavailable() {
        let fx = Fixture::new(64, 1, |_| {});
        let allocator = fx.allocator();
        fx.store.set_available(false);
        assert!(matches!(
            allocator.reserve(1).await,
            Err(ServiceError::AllocationUnavailable(_))
        ));
        fx.store.set_available(true);
        assert!(allocator.reserve(1).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_amounts_are_rejected() {
        let fx = Fixture::new(64, 1, |_| {});
        let allocator = fx.allocator();
        assert!(matches!(
            allocator.reserve(0).await,
            Err(ServiceError::InvalidRequest(_))
        ));
        assert!(matches!(
            allocator.reserve(MAX_RESERVE + 1).await,
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn retired_references_are_not_reissued() {
        let fx = Fixture::new(8, 1, |p| p.prefetch.threshold = 0);
        let allocator = fx.allocator();
        let Ok(refs) = allocator.reserve(4).await else {
            panic!("reserve should succeed");
        };
        let Some(freed) = refs.first() else {
            panic!("one reference expected");
        };
        assert!(allocator.free(freed).await.is_ok());
        let Ok(more) = allocator.reserve(4).await else {
            panic!("reserve should succeed");
        };
        assert!(!more.contains(freed));
    }

    #[tokio::test]
    async fn reused_references_come_back() {
        let fx = Fixture::new(8, 1, |p| {
            p.reuse_policy = ReusePolicy::Reuse;
            p.prefetch.threshold = 0;
        });
        let allocator = fx.allocator();
        let Ok(refs) = allocator.reserve(4).await else {
            panic!("reserve should succeed");
        };
        let Some(freed) = refs.first() else {
            panic!("one reference expected");
        };
        assert!(allocator.free(freed).await.is_ok());
        let Ok(more) = allocator.reserve(4).await else {
            panic!("reserve should succeed");
        };
        assert!(more.contains(freed));
    }

    #[tokio::test]
    async fn unknown_references_are_rejected() {
        let fx = Fixture::new(64, 1, |_| {});
        let allocator = fx.allocator();
        let Ok(refs) = allocator.reserve(1).await else {
            panic!("reserve should succeed");
        };
        let Some(issued) = refs.first() else {
            panic!("one reference expected");
        };

        let unclaimed = Reference::new(issued.uri.clone(), 63);
        assert!(matches!(
            allocator.free(&unclaimed).await,
            Err(ServiceError::UnknownReference { .. })
        ));
        let foreign = Reference::new("https://status.example.com/not-a-list", 0);
        assert!(matches!(
            allocator.free(&foreign).await,
            Err(ServiceError::UnknownReference { .. })
        ));

        assert!(allocator.free(issued).await.is_ok());
        assert!(matches!(
            allocator.free(issued).await,
            Err(ServiceError::UnknownReference { .. })
        ));
    }

    #[tokio::test]
    async fn indices_buffered_elsewhere_cannot_be_freed() {
        let fx = Fixture::new(64, 1, |p| {
            p.reuse_policy = ReusePolicy::Reuse;
            p.prefetch.threshold = 0;
        });
        let a = fx.allocator();
        let b = fx.allocator();
        let Ok(first) = a.reserve(1).await else {
            panic!("reserve should succeed");
        };
        let Some(issued) = first.first() else {
            panic!("one reference expected");
        };
        assert_eq!(a.buffered(), 3);

        let buffered_by_a = Reference::new(issued.uri.clone(), issued.index + 1);
        assert!(matches!(
            b.free(&buffered_by_a).await,
            Err(ServiceError::UnknownReference { .. })
        ));

        let mut seen: HashSet<Reference> = first.into_iter().collect();
        for allocator in [&b, &a] {
            let Ok(refs) = allocator.reserve(3).await else {
                panic!("reserve should succeed");
            };
            for r in refs {
                assert!(seen.insert(r), "reference handed out twice");
            }
        }
    }

    #[tokio::test]
    async fn repeated_free_does_not_reissue_a_live_reference() {
        let fx = Fixture::new(64, 1, |p| {
            p.reuse_policy = ReusePolicy::Reuse;
            p.prefetch.capacity = 1;
            p.prefetch.threshold = 0;
        });
        let allocator = fx.allocator();

        let first = reserve_one(&allocator).await;
        assert!(allocator.free(&first).await.is_ok());
        let second_holder = reserve_one(&allocator).await;
        assert_eq!(second_holder, first);

        // A late retry of the first release retires the index instead of
        // putting it back into circulation.
        assert!(allocator.free(&first).await.is_ok());
        let third_holder = reserve_one(&allocator).await;
        assert_ne!(third_holder, second_holder);
    }

    #[tokio::test]
    async fn large_reservations_span_many_lists() {
        let fx = Fixture::new(128, 1, |p| p.prefetch.threshold = 0);
        let allocator = fx.allocator();
        let Ok(refs) = allocator.reserve(1_000).await else {
            panic!("reserve should succeed");
        };
        assert_eq!(refs.len(), 1_000);
        let unique: HashSet<&Reference> = refs.iter().collect();
        assert_eq!(unique.len(), 1_000);
        let uris: HashSet<&str> = refs.iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(uris.len(), 8);
    }

    #[tokio::test]
    async fn shutdown_returns_buffer_for_the_next_instance() {
        let fx = Fixture::new(64, 1, |_| {});
        let first = fx.allocator();
        let Ok(issued) = first.reserve(1).await else {
            panic!("reserve should succeed");
        };
        let buffered = first.buffered();
        assert!(buffered > 0);
        assert!(matches!(first.shutdown().await, Ok(n) if n == buffered));

        let second = fx.allocator();
        let Ok(next) = second.reserve(1).await else {
            panic!("reserve should succeed");
        };
        assert_ne!(issued, next);
        let Some(reference) = next.first() else {
            panic!("one reference expected");
        };
        assert!(reference.index < 4);
    }

    #[tokio::test]
    async fn state_follows_lifecycle() {
        let fx = Fixture::new(8, 1, |_| {});
        let allocator = fx.allocator();
        assert!(matches!(allocator.state().await, Ok(AllocatorState::NeedsList)));

        assert!(matches!(allocator.refill().await, Ok(4)));
        assert!(matches!(allocator.state().await, Ok(AllocatorState::Active)));

        let Ok(lists) = fx.store.current_lists(&fx.pool.id).await else {
            panic!("lists should load");
        };
        let Some(list) = lists.first() else {
            panic!("one list expected");
        };
        // Another instance claims most of what is left.
        let _ = fx.store.claim_batch(list.list_id, 3).await;
        assert!(matches!(allocator.shutdown().await, Ok(4)));
        assert!(matches!(
            allocator.state().await,
            Ok(AllocatorState::NearExhaustion)
        ));

        let _ = fx.store.claim_batch(list.list_id, 1).await;
        assert!(matches!(allocator.state().await, Ok(AllocatorState::Exhausted)));
    }
}
