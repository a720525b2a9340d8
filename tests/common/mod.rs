//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::panic)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use status_list_service::app_state::AppState;
use status_list_service::build_app;
use status_list_service::config::{PoolConfig, ServiceConfig, SignerConfig};
use status_list_service::domain::status_list::StatusList;
use status_list_service::domain::{
    Claim, EventBus, ListId, ListRecord, ListState, ListStorageMetadata, ManualClock, PoolId,
    Release, SharedClock, StoredToken,
};
use status_list_service::error::ServiceError;
use status_list_service::persistence::{MemoryStore, SharedStore, StatusStore};
use status_list_service::service::StatusListService;

/// API key accepted by every test pool.
pub const API_KEY: &str = "integration-key";

/// Base64url of the 32-byte seed `0x00..0x1f`.
pub const KEY_SEED: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8";

/// Parses a pool id, panicking on invalid input.
pub fn pool_id(id: &str) -> PoolId {
    let Ok(pool_id) = PoolId::new(id) else {
        panic!("valid pool id {id}");
    };
    pool_id
}

/// Pool with the shared test key and signer and a small prefetch buffer.
pub fn pool(id: &str, size: u64, bits: u8, configure: impl FnOnce(&mut PoolConfig)) -> PoolConfig {
    let signer = SignerConfig {
        key_seed: KEY_SEED.to_string(),
        kid: Some("test".to_string()),
    };
    let mut pool =
        PoolConfig::new(pool_id(id), size, bits, "https://issuer.example.com", signer)
            .with_api_key(API_KEY);
    pool.prefetch.capacity = 8;
    pool.prefetch.threshold = 2;
    configure(&mut pool);
    pool
}

/// A fresh clock and a memory store driven by it.
pub fn memory_store() -> (ManualClock, Arc<MemoryStore>) {
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    (clock, store)
}

/// Builds a service instance on top of `store`.
pub async fn service(
    pools: Vec<PoolConfig>,
    store: SharedStore,
    clock: &ManualClock,
    public_url: &str,
) -> Arc<StatusListService> {
    let config = ServiceConfig {
        public_url: public_url.to_string(),
        store_timeout: std::time::Duration::from_secs(2),
        ..ServiceConfig::default()
    };
    let shared: SharedClock = Arc::new(clock.clone());
    let bus = EventBus::new(1_024);
    match StatusListService::build(&config, pools, store, bus, shared).await {
        Ok(service) => Arc::new(service),
        Err(e) => panic!("service should build: {e}"),
    }
}

/// Binds an ephemeral port, then builds the service with the matching
/// public URL and serves the full router on it.
pub async fn serve(
    pools: Vec<PoolConfig>,
) -> (SocketAddr, Arc<StatusListService>, ManualClock) {
    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind should succeed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("listener has an address");
    };
    let (clock, store) = memory_store();
    let service = service(pools, store, &clock, &format!("http://{addr}")).await;
    let app = build_app(AppState::new(Arc::clone(&service)));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, service, clock)
}

/// Store wrapper that injects claim failures and can pin the metadata a
/// reader observes.
///
/// Every `fail_before`-th claim fails without touching the counter; every
/// `fail_after`-th claim commits and then reports a failure, losing the
/// claimed range. `0` disables a fault. Status writes fail while
/// [`FaultyStore::fail_next_updates`] has failures left.
#[derive(Debug)]
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    claims: AtomicU64,
    fail_before: u64,
    fail_after: u64,
    failing_updates: AtomicU64,
    pinned: Mutex<HashMap<ListId, Option<ListStorageMetadata>>>,
}

impl FaultyStore {
    /// Wraps `inner` with the given fault periods.
    pub fn new(inner: Arc<MemoryStore>, fail_before: u64, fail_after: u64) -> Self {
        Self {
            inner,
            claims: AtomicU64::new(0),
            fail_before,
            fail_after,
            failing_updates: AtomicU64::new(0),
            pinned: Mutex::new(HashMap::new()),
        }
    }

    /// Makes `metadata` return `snapshot` for `list_id` from now on.
    pub fn pin_metadata(&self, list_id: ListId, snapshot: Option<ListStorageMetadata>) {
        self.pinned.lock().insert(list_id, snapshot);
    }

    /// Makes the next `n` status writes fail without touching the data.
    pub fn fail_next_updates(&self, n: u64) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    fn injected(&self, what: &str) -> ServiceError {
        ServiceError::Persistence(format!("injected fault {what}"))
    }
}

#[async_trait]
impl StatusStore for FaultyStore {
    async fn create_or_verify_pool(
        &self,
        pool_id: &PoolId,
        size: u64,
        bits: u8,
    ) -> Result<(), ServiceError> {
        self.inner.create_or_verify_pool(pool_id, size, bits).await
    }

    async fn create_list(&self, record: &ListRecord) -> Result<(), ServiceError> {
        self.inner.create_list(record).await
    }

    async fn list(&self, list_id: ListId) -> Result<Option<ListRecord>, ServiceError> {
        self.inner.list(list_id).await
    }

    async fn current_lists(&self, pool_id: &PoolId) -> Result<Vec<ListRecord>, ServiceError> {
        self.inner.current_lists(pool_id).await
    }

    async fn all_lists(&self, pool_id: &PoolId) -> Result<Vec<ListRecord>, ServiceError> {
        self.inner.all_lists(pool_id).await
    }

    async fn claim_batch(&self, list_id: ListId, count: u64) -> Result<Claim, ServiceError> {
        let n = self.claims.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_before != 0 && n % self.fail_before == 0 {
            return Err(self.injected("before commit"));
        }
        let claim = self.inner.claim_batch(list_id, count).await?;
        if self.fail_after != 0 && n % self.fail_after == 0 {
            return Err(self.injected("after commit"));
        }
        Ok(claim)
    }

    async fn set_list_state(
        &self,
        list_id: ListId,
        state: ListState,
    ) -> Result<(), ServiceError> {
        self.inner.set_list_state(list_id, state).await
    }

    async fn mark_issued(&self, list_id: ListId, indices: &[u64]) -> Result<(), ServiceError> {
        self.inner.mark_issued(list_id, indices).await
    }

    async fn return_unissued(
        &self,
        list_id: ListId,
        indices: &[u64],
    ) -> Result<(), ServiceError> {
        self.inner.return_unissued(list_id, indices).await
    }

    async fn free_issued(
        &self,
        list_id: ListId,
        index: u64,
        reusable: bool,
    ) -> Result<Option<Release>, ServiceError> {
        self.inner.free_issued(list_id, index, reusable).await
    }

    async fn take_freed(&self, list_id: ListId, max: u64) -> Result<Vec<u64>, ServiceError> {
        self.inner.take_freed(list_id, max).await
    }

    async fn update_status(
        &self,
        list_id: ListId,
        index: u64,
        value: u8,
    ) -> Result<u64, ServiceError> {
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(self.injected("on status write"));
        }
        self.inner.update_status(list_id, index, value).await
    }

    async fn list_data(&self, list_id: ListId) -> Result<(StatusList, u64), ServiceError> {
        self.inner.list_data(list_id).await
    }

    async fn metadata(
        &self,
        list_id: ListId,
    ) -> Result<Option<ListStorageMetadata>, ServiceError> {
        let pinned = self.pinned.lock().get(&list_id).cloned();
        if let Some(snapshot) = pinned {
            return Ok(snapshot);
        }
        self.inner.metadata(list_id).await
    }

    async fn load_token(&self, list_id: ListId) -> Result<Option<StoredToken>, ServiceError> {
        self.inner.load_token(list_id).await
    }

    async fn store_token(
        &self,
        list_id: ListId,
        token: &[u8],
        metadata: &ListStorageMetadata,
        expected_version: u64,
    ) -> Result<(), ServiceError> {
        self.inner
            .store_token(list_id, token, metadata, expected_version)
            .await
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        self.inner.try_acquire_lease(name, holder, ttl).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ServiceError> {
        self.inner.release_lease(name, holder).await
    }
}
