//! Persistence layer: list records, counters, status data and tokens.
//!
//! [`StatusStore`] is the only state shared between service instances. The
//! allocation counter of every list lives here and is advanced with a
//! single atomic claim, so no two instances can ever hand out the same
//! index. Two implementations exist: [`MemoryStore`] for single-process
//! deployments and tests, and [`PostgresStore`] backed by `sqlx::PgPool`.
//!
//! Each claimed index moves through a small state machine kept next to
//! the counter:
//!
//! ```text
//! claim_batch ──> pending ──mark_issued──> issued ──free_issued──> freed | retired
//!                    │                                               │
//!                    └──return_unissued──> freed ──take_freed──> recycled
//! recycled ──mark_issued──> reissued ──free_issued──> retired
//! ```
//!
//! Only `issued` and `reissued` indices can be released by a holder, and a
//! reissued index is retired on release, so a stale or repeated release can
//! never put a live index back into circulation.

pub mod memory;
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use crate::domain::status_list::StatusList;
use crate::domain::{
    Claim, ListId, ListRecord, ListState, ListStorageMetadata, PoolId, Release, StoredToken,
};
use crate::error::ServiceError;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Shared handle to a [`StatusStore`].
pub type SharedStore = Arc<dyn StatusStore>;

/// Durable storage of pools, lists and published tokens.
///
/// Every method is a single round trip from the caller's point of view and
/// either fully happens or not at all.
#[async_trait]
pub trait StatusStore: Send + Sync + fmt::Debug {
    /// Registers a pool, or verifies that an already registered pool has the
    /// same shape.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] if the pool exists with a different
    /// size or bit width.
    async fn create_or_verify_pool(
        &self,
        pool_id: &PoolId,
        size: u64,
        bits: u8,
    ) -> Result<(), ServiceError>;

    /// Persists a new list with all values zero.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn create_list(&self, record: &ListRecord) -> Result<(), ServiceError>;

    /// Loads one list record.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn list(&self, list_id: ListId) -> Result<Option<ListRecord>, ServiceError>;

    /// Active lists of a pool, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn current_lists(&self, pool_id: &PoolId) -> Result<Vec<ListRecord>, ServiceError>;

    /// All lists of a pool regardless of state, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn all_lists(&self, pool_id: &PoolId) -> Result<Vec<ListRecord>, ServiceError>;

    /// Atomically advances the list's counter by up to `count` and marks
    /// the claimed indices pending.
    ///
    /// Returns the claimed range. A zero `count` means the list is
    /// exhausted or no longer active.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ListNotFound`] for an unknown list and
    /// [`ServiceError::Persistence`] on storage failure, in which case
    /// nothing was claimed.
    async fn claim_batch(&self, list_id: ListId, count: u64) -> Result<Claim, ServiceError>;

    /// Moves a list to another lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ListNotFound`] for an unknown list.
    async fn set_list_state(&self, list_id: ListId, state: ListState)
    -> Result<(), ServiceError>;

    /// Marks pending indices as handed out to a caller. Indices in any
    /// other state are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure, in which
    /// case nothing was marked.
    async fn mark_issued(&self, list_id: ListId, indices: &[u64]) -> Result<(), ServiceError>;

    /// Moves pending indices that were never handed out to the freed set.
    /// Indices in any other state are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn return_unissued(&self, list_id: ListId, indices: &[u64])
    -> Result<(), ServiceError>;

    /// Atomically releases one issued index.
    ///
    /// A first-generation index goes to the freed set when `reusable`,
    /// otherwise it is retired; a reissued index is always retired. Returns
    /// `None` if the index is not currently issued (never claimed, still
    /// pending, or already released).
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn free_issued(
        &self,
        list_id: ListId,
        index: u64,
        reusable: bool,
    ) -> Result<Option<Release>, ServiceError>;

    /// Atomically moves up to `max` freed indices back to pending and
    /// returns them.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn take_freed(&self, list_id: ListId, max: u64) -> Result<Vec<u64>, ServiceError>;

    /// Writes one status value and returns the list's new data version.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::OutOfRange`] / [`ServiceError::ValueOutOfRange`]
    /// for invalid input and [`ServiceError::ListNotFound`] for an unknown
    /// list.
    async fn update_status(&self, list_id: ListId, index: u64, value: u8)
    -> Result<u64, ServiceError>;

    /// Current status data of a list and its data version.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ListNotFound`] for an unknown list.
    async fn list_data(&self, list_id: ListId) -> Result<(StatusList, u64), ServiceError>;

    /// Metadata of the last published token, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn metadata(&self, list_id: ListId) -> Result<Option<ListStorageMetadata>, ServiceError>;

    /// Last published token, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn load_token(&self, list_id: ListId) -> Result<Option<StoredToken>, ServiceError>;

    /// Stores a token if the currently stored publication version equals
    /// `expected_version` (`0` when nothing was published yet).
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::StaleWrite`] if another writer advanced the
    /// version first.
    async fn store_token(
        &self,
        list_id: ListId,
        token: &[u8],
        metadata: &ListStorageMetadata,
        expected_version: u64,
    ) -> Result<(), ServiceError>;

    /// Acquires or renews the named lease for `holder` until `now + ttl`.
    /// Returns `false` while another holder owns an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError>;

    /// Releases the named lease if `holder` owns it.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] on storage failure.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ServiceError>;
}
