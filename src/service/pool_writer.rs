//! Periodic publication of signed status list tokens.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::domain::token::{StatusListClaim, StatusListClaims};
use crate::domain::{EventBus, ListRecord, ListStorageMetadata, SharedClock, StatusEvent};
use crate::error::ServiceError;
use crate::persistence::SharedStore;
use crate::service::StatusListCache;
use crate::service::signer::SharedSigner;

/// Re-serializes, signs and stores the tokens of one pool.
///
/// Runs every `update_interval` under the cross-process lease
/// `writer:{pool}`, so only one instance writes a pool at a time. A list
/// is written when it has no token yet, when its data changed since the
/// last token, or when the token expires within two update intervals.
/// Every write is a compare-and-set on the publication version; losing
/// the race yields [`ServiceError::StaleWrite`] and ends the cycle.
#[derive(Debug)]
pub struct PoolWriter {
    pool: Arc<PoolConfig>,
    store: SharedStore,
    signer: SharedSigner,
    cache: Arc<StatusListCache>,
    event_bus: EventBus,
    clock: SharedClock,
    aggregation_uri: Option<String>,
    holder: String,
}

impl PoolWriter {
    /// Creates a writer for `pool`.
    ///
    /// `holder` identifies this process in lease records.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<PoolConfig>,
        store: SharedStore,
        signer: SharedSigner,
        cache: Arc<StatusListCache>,
        event_bus: EventBus,
        clock: SharedClock,
        aggregation_uri: Option<String>,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            store,
            signer,
            cache,
            event_bus,
            clock,
            aggregation_uri,
            holder: holder.into(),
        }
    }

    fn lease_name(&self) -> String {
        format!("writer:{}", self.pool.id)
    }

    /// Runs one publication cycle and returns the number of written tokens.
    ///
    /// Returns `Ok(0)` without touching any list when another instance
    /// holds the lease.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::StaleWrite`] if another writer published a
    /// list first, or the store/signing error that ended the cycle.
    pub async fn run_once(&self) -> Result<usize, ServiceError> {
        let lease = self.lease_name();
        let ttl = self.pool.update_interval_chrono() * 2;
        if !self
            .store
            .try_acquire_lease(&lease, &self.holder, ttl)
            .await?
        {
            debug!(pool_id = %self.pool.id, "writer lease held elsewhere");
            return Ok(0);
        }

        let result = self.write_all().await;
        if let Err(e) = self.store.release_lease(&lease, &self.holder).await {
            warn!(pool_id = %self.pool.id, error = %e, "failed to release writer lease");
        }
        result
    }

    async fn write_all(&self) -> Result<usize, ServiceError> {
        let mut written = 0;
        for record in self.store.all_lists(&self.pool.id).await? {
            if self.write_list(&record, false).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Publishes the first token of a freshly created list.
    ///
    /// # Errors
    ///
    /// See [`PoolWriter::write_list`].
    pub async fn publish_initial(&self, record: &ListRecord) -> Result<(), ServiceError> {
        self.write_list(record, true).await.map(|_| ())
    }

    /// Writes the token of `record` if it is due, or unconditionally with
    /// `force`. Returns whether a token was written.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::StaleWrite`] if the stored publication
    /// version moved since it was read, or the store/signing error.
    pub async fn write_list(&self, record: &ListRecord, force: bool) -> Result<bool, ServiceError> {
        let current = self
            .store
            .metadata(record.list_id)
            .await?
            .unwrap_or_else(|| ListStorageMetadata::unpublished(record.list_id, self.clock.now()));
        self.write_observed(record, &current, force).await
    }

    /// Writes `record` on top of the publication `current` was read from.
    async fn write_observed(
        &self,
        record: &ListRecord,
        current: &ListStorageMetadata,
        force: bool,
    ) -> Result<bool, ServiceError> {
        let now = self.clock.now();
        let list_id = record.list_id;
        let (list, data_version) = self.store.list_data(list_id).await?;

        let window = self.pool.update_interval_chrono() * 2;
        if !force && !current.is_outdated(data_version) && !current.may_expire_within(window, now)
        {
            return Ok(false);
        }

        let expires_at = now + self.pool.list_lifetime_chrono();
        let claims = StatusListClaims {
            sub: record.uri.clone(),
            iss: self.pool.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            ttl: self.pool.update_interval.as_secs(),
            status_list: StatusListClaim {
                bits: list.bits(),
                lst: list.encode()?,
                aggregation_uri: self.aggregation_uri.clone(),
            },
        };
        let claims = serde_json::to_value(&claims)
            .map_err(|e| ServiceError::Signing(format!("claims: {e}")))?;
        let token = self.signer.sign(&claims)?;

        let next = ListStorageMetadata {
            list_id,
            version: current.version + 1,
            data_version,
            created_at: now,
            expires_at,
        };
        self.store
            .store_token(list_id, token.as_bytes(), &next, current.version)
            .await?;
        self.cache.invalidate(list_id);

        info!(
            pool_id = %self.pool.id,
            list_uri = %record.uri,
            version = next.version,
            data_version,
            "status list published"
        );
        let _ = self.event_bus.publish(StatusEvent::ListPublished {
            pool_id: self.pool.id.clone(),
            list_uri: record.uri.clone(),
            version: next.version,
            expires_at,
            timestamp: now,
        });
        Ok(true)
    }

    /// Runs [`PoolWriter::run_once`] every `update_interval` until
    /// `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.pool.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(written) => debug!(pool_id = %self.pool.id, written, "writer cycle done"),
                        Err(e @ ServiceError::StaleWrite { .. }) => {
                            info!(pool_id = %self.pool.id, error = %e, "writer cycle lost a race, retrying next interval");
                        }
                        Err(e) => warn!(pool_id = %self.pool.id, error = %e, "writer cycle failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(pool_id = %self.pool.id, "writer stopped");
                        break;
                    }
                }
            }
        }
    }
}
