//! Ahead-of-demand creation of successor lists.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::domain::{EventBus, ListId, ListRecord, ListState, SharedClock, StatusEvent};
use crate::error::ServiceError;
use crate::persistence::SharedStore;
use crate::service::pool_writer::PoolWriter;

/// Keeps `precreation.batch_count` fresh lists available for a pool.
///
/// Runs every `precreation.interval` under the lease `precreation:{pool}`
/// and can be woken early by the pool's allocator. A run freezes lists
/// that are exhausted or expire before the next run, tops the fresh
/// lists (active, nothing claimed, not expiring soon) back up to
/// `batch_count` and retires frozen lists once a successor is active.
#[derive(Debug)]
pub struct PrecreationScheduler {
    pool: Arc<PoolConfig>,
    store: SharedStore,
    writer: Arc<PoolWriter>,
    event_bus: EventBus,
    clock: SharedClock,
    public_url: String,
    holder: String,
    wake: Notify,
    create_lock: Mutex<()>,
}

impl PrecreationScheduler {
    /// Creates a scheduler for `pool`. New lists get URIs under
    /// `public_url`.
    #[must_use]
    pub fn new(
        pool: Arc<PoolConfig>,
        store: SharedStore,
        writer: Arc<PoolWriter>,
        event_bus: EventBus,
        clock: SharedClock,
        public_url: impl Into<String>,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            store,
            writer,
            event_bus,
            clock,
            public_url: public_url.into(),
            holder: holder.into(),
            wake: Notify::new(),
            create_lock: Mutex::new(()),
        }
    }

    /// Asks the background task to run before its next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Runs one maintenance pass and returns the number of created lists.
    ///
    /// # Errors
    ///
    /// Returns the store error that interrupted the pass.
    pub async fn run_once(&self) -> Result<usize, ServiceError> {
        let lease = format!("precreation:{}", self.pool.id);
        let ttl = self.pool.precreation_interval_chrono();
        if !self
            .store
            .try_acquire_lease(&lease, &self.holder, ttl)
            .await?
        {
            debug!(pool_id = %self.pool.id, "precreation lease held elsewhere");
            return Ok(0);
        }

        let result = self.maintain().await;
        if let Err(e) = self.store.release_lease(&lease, &self.holder).await {
            warn!(pool_id = %self.pool.id, error = %e, "failed to release precreation lease");
        }
        result
    }

    async fn maintain(&self) -> Result<usize, ServiceError> {
        let _guard = self.create_lock.lock().await;
        let now = self.clock.now();
        let next_run = now + self.pool.precreation_interval_chrono();

        let mut fresh: u32 = 0;
        for record in self.store.current_lists(&self.pool.id).await? {
            if record.remaining() == 0 || record.expires_at <= next_run {
                self.freeze(&record).await?;
            } else if record.is_fresh() {
                fresh += 1;
            }
        }

        let missing = self.pool.precreation.batch_count.saturating_sub(fresh);
        for _ in 0..missing {
            self.create_list().await?;
        }

        for record in self.store.all_lists(&self.pool.id).await? {
            if record.state == ListState::Frozen {
                self.store
                    .set_list_state(record.list_id, ListState::Retired)
                    .await?;
                debug!(pool_id = %self.pool.id, list_uri = %record.uri, "list retired");
            }
        }
        Ok(missing as usize)
    }

    async fn freeze(&self, record: &ListRecord) -> Result<(), ServiceError> {
        self.store
            .set_list_state(record.list_id, ListState::Frozen)
            .await?;
        info!(
            pool_id = %self.pool.id,
            list_uri = %record.uri,
            claimed = record.claimed,
            "list frozen"
        );
        Ok(())
    }

    /// Returns an allocatable list, creating one if none exists.
    ///
    /// Called by the allocator when every active list is used up. Calls
    /// are serialized per process, so concurrent callers share one new
    /// list.
    ///
    /// # Errors
    ///
    /// Returns the store error if the list cannot be created.
    pub async fn create_now(&self) -> Result<ListRecord, ServiceError> {
        let _guard = self.create_lock.lock().await;
        let now = self.clock.now();
        if let Some(record) = self
            .store
            .current_lists(&self.pool.id)
            .await?
            .into_iter()
            .find(|r| r.is_allocatable(now))
        {
            return Ok(record);
        }
        warn!(pool_id = %self.pool.id, "no allocatable list, creating one synchronously");
        self.create_list().await
    }

    async fn create_list(&self) -> Result<ListRecord, ServiceError> {
        let now = self.clock.now();
        let list_id = ListId::new();
        let record = ListRecord {
            list_id,
            uri: list_id.uri(&self.public_url),
            pool_id: self.pool.id.clone(),
            bits: self.pool.bits,
            size: self.pool.size,
            claimed: 0,
            version: 0,
            state: ListState::Active,
            created_at: now,
            expires_at: now + self.pool.list_lifetime_chrono(),
        };
        self.store.create_list(&record).await?;

        info!(pool_id = %self.pool.id, list_uri = %record.uri, size = record.size, "list created");
        let _ = self.event_bus.publish(StatusEvent::ListCreated {
            pool_id: self.pool.id.clone(),
            list_uri: record.uri.clone(),
            size: record.size,
            timestamp: now,
        });

        if let Err(e) = self.writer.publish_initial(&record).await {
            warn!(
                pool_id = %self.pool.id,
                list_uri = %record.uri,
                error = %e,
                "initial publication failed, the writer will retry"
            );
        }
        Ok(record)
    }

    /// Runs [`PrecreationScheduler::run_once`] on every tick or wake-up
    /// until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.pool.precreation.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_logged().await,
                () = self.wake.notified() => self.run_logged().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(pool_id = %self.pool.id, "precreation stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn run_logged(&self) {
        match self.run_once().await {
            Ok(0) => {}
            Ok(created) => debug!(pool_id = %self.pool.id, created, "precreation pass done"),
            Err(e) => warn!(pool_id = %self.pool.id, error = %e, "precreation pass failed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::config::SignerConfig;
    use crate::domain::{ManualClock, PoolId};
    use crate::persistence::{MemoryStore, StatusStore};
    use crate::service::StatusListCache;
    use crate::service::signer::Ed25519JwtSigner;

    struct Fixture {
        scheduler: PrecreationScheduler,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        pool_id: PoolId,
    }

    fn fixture(batch_count: u32) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(Arc::clone(&shared_clock)));
        let Ok(pool_id) = PoolId::new("pre") else {
            panic!("valid pool id");
        };
        let signer = SignerConfig {
            key_seed: String::new(),
            kid: None,
        };
        let mut pool = PoolConfig::new(pool_id.clone(), 16, 1, "https://issuer.example", signer);
        pool.precreation.batch_count = batch_count;
        pool.list_lifetime = std::time::Duration::from_secs(3_600);
        let pool = Arc::new(pool);
        let bus = EventBus::new(16);
        let cache = Arc::new(StatusListCache::new(
            4,
            Duration::seconds(60),
            Duration::hours(1),
            Arc::clone(&store) as SharedStore,
            bus.clone(),
            Arc::clone(&shared_clock),
        ));
        let writer = Arc::new(PoolWriter::new(
            Arc::clone(&pool),
            Arc::clone(&store) as SharedStore,
            Arc::new(Ed25519JwtSigner::new(&[5u8; 32], None)),
            cache,
            bus.clone(),
            Arc::clone(&shared_clock),
            None,
            "test",
        ));
        let scheduler = PrecreationScheduler::new(
            pool,
            Arc::clone(&store) as SharedStore,
            writer,
            bus,
            shared_clock,
            "https://status.example.com",
            "test",
        );
        Fixture {
            scheduler,
            store,
            clock,
            pool_id,
        }
    }

    async fn states(fx: &Fixture) -> Vec<ListState> {
        let Ok(lists) = fx.store.all_lists(&fx.pool_id).await else {
            panic!("lists should load");
        };
        lists.into_iter().map(|l| l.state).collect()
    }

    #[tokio::test]
    async fn creates_batch_and_publishes_it() {
        let fx = fixture(2);
        assert!(matches!(fx.scheduler.run_once().await, Ok(2)));
        assert!(matches!(fx.scheduler.run_once().await, Ok(0)));

        let Ok(lists) = fx.store.all_lists(&fx.pool_id).await else {
            panic!("lists should load");
        };
        assert_eq!(lists.len(), 2);
        for list in lists {
            let Ok(token) = fx.store.load_token(list.list_id).await else {
                panic!("token lookup");
            };
            assert!(token.is_some());
            assert!(list.uri.starts_with("https://status.example.com/"));
        }
    }

    #[tokio::test]
    async fn successor_created_once_first_list_is_in_use() {
        let fx = fixture(1);
        let _ = fx.scheduler.run_once().await;
        let Ok(lists) = fx.store.current_lists(&fx.pool_id).await else {
            panic!("lists should load");
        };
        let Some(first) = lists.first() else {
            panic!("one list expected");
        };
        let _ = fx.store.claim_batch(first.list_id, 4).await;

        assert!(matches!(fx.scheduler.run_once().await, Ok(1)));
        assert_eq!(states(&fx).await, vec![ListState::Active, ListState::Active]);
    }

    #[tokio::test]
    async fn expiring_lists_are_frozen_then_retired() {
        let fx = fixture(1);
        let _ = fx.scheduler.run_once().await;
        fx.clock.advance(Duration::seconds(3_600 - 30));

        assert!(matches!(fx.scheduler.run_once().await, Ok(1)));
        assert_eq!(states(&fx).await, vec![ListState::Retired, ListState::Active]);
    }

    #[tokio::test]
    async fn create_now_reuses_allocatable_list() {
        let fx = fixture(1);
        let Ok(first) = fx.scheduler.create_now().await else {
            panic!("list should be created");
        };
        let Ok(second) = fx.scheduler.create_now().await else {
            panic!("list should be returned");
        };
        assert_eq!(first.list_id, second.list_id);
    }

    #[tokio::test]
    async fn lease_held_elsewhere_skips_the_pass() {
        let fx = fixture(1);
        let Ok(true) = fx
            .store
            .try_acquire_lease("precreation:pre", "other", Duration::minutes(5))
            .await
        else {
            panic!("lease should be free");
        };
        assert!(matches!(fx.scheduler.run_once().await, Ok(0)));
        assert!(states(&fx).await.is_empty());
    }
}
