//! In-process implementation of [`StatusStore`].

use std::collections::{BTreeSet, HashMap};
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::StatusStore;
use crate::domain::status_list::StatusList;
use crate::domain::{
    Claim, ListId, ListRecord, ListState, ListStorageMetadata, PoolId, Release, SharedClock,
    StoredToken,
};
use crate::error::ServiceError;

/// State of a claimed index. Claimed indices without a slot are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Recycled,
    Freed,
    Reissued,
    Retired,
}

#[derive(Debug)]
struct MemoryList {
    record: ListRecord,
    data: StatusList,
    slots: HashMap<u64, Slot>,
    freed: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    pools: HashMap<PoolId, (u64, u8)>,
    lists: HashMap<ListId, MemoryList>,
    tokens: HashMap<ListId, StoredToken>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
}

impl MemoryState {
    fn list_mut(&mut self, list_id: ListId) -> Result<&mut MemoryList, ServiceError> {
        self.lists
            .get_mut(&list_id)
            .ok_or_else(|| ServiceError::ListNotFound(list_id.to_string()))
    }

    fn pool_lists(&self, pool_id: &PoolId, only_active: bool) -> Vec<ListRecord> {
        let mut lists: Vec<ListRecord> = self
            .lists
            .values()
            .map(|l| &l.record)
            .filter(|r| &r.pool_id == pool_id && (!only_active || r.state == ListState::Active))
            .cloned()
            .collect();
        lists.sort_by_key(|r| (r.created_at, r.list_id));
        lists
    }
}

/// [`StatusStore`] keeping everything in one mutex-guarded map.
///
/// Every operation runs under a single short critical section, which makes
/// each one atomic. State survives as long as the value does, so tests can
/// drop and rebuild allocators against the same store to simulate a
/// process restart. [`MemoryStore::set_available`] simulates an outage.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    clock: SharedClock,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Makes every subsequent call fail (`false`) or succeed again (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServiceError::Persistence("memory store unavailable".to_string()))
        }
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn create_or_verify_pool(
        &self,
        pool_id: &PoolId,
        size: u64,
        bits: u8,
    ) -> Result<(), ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.pools.get(pool_id) {
            Some(&(s, b)) if s != size || b != bits => Err(ServiceError::Config(format!(
                "pool {pool_id} already stored with size {s} and {b} bit(s)"
            ))),
            Some(_) => Ok(()),
            None => {
                state.pools.insert(pool_id.clone(), (size, bits));
                Ok(())
            }
        }
    }

    async fn create_list(&self, record: &ListRecord) -> Result<(), ServiceError> {
        self.check_available()?;
        let data = StatusList::new(record.size, record.bits)?;
        let mut state = self.state.lock();
        if state.lists.contains_key(&record.list_id) {
            return Err(ServiceError::Persistence(format!(
                "list {} already exists",
                record.list_id
            )));
        }
        state.lists.insert(
            record.list_id,
            MemoryList {
                record: record.clone(),
                data,
                slots: HashMap::new(),
                freed: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn list(&self, list_id: ListId) -> Result<Option<ListRecord>, ServiceError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .lists
            .get(&list_id)
            .map(|l| l.record.clone()))
    }

    async fn current_lists(&self, pool_id: &PoolId) -> Result<Vec<ListRecord>, ServiceError> {
        self.check_available()?;
        Ok(self.state.lock().pool_lists(pool_id, true))
    }

    async fn all_lists(&self, pool_id: &PoolId) -> Result<Vec<ListRecord>, ServiceError> {
        self.check_available()?;
        Ok(self.state.lock().pool_lists(pool_id, false))
    }

    async fn claim_batch(&self, list_id: ListId, count: u64) -> Result<Claim, ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let list = state.list_mut(list_id)?;
        let record = &mut list.record;
        let start = record.claimed;
        if record.state != ListState::Active {
            return Ok(Claim { start, count: 0 });
        }
        let count = count.min(record.remaining());
        record.claimed += count;
        let claim = Claim { start, count };
        list.slots
            .extend(claim.indices().map(|index| (index, Slot::Pending)));
        Ok(claim)
    }

    async fn set_list_state(
        &self,
        list_id: ListId,
        list_state: ListState,
    ) -> Result<(), ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.list_mut(list_id)?.record.state = list_state;
        Ok(())
    }

    async fn mark_issued(&self, list_id: ListId, indices: &[u64]) -> Result<(), ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let list = state.list_mut(list_id)?;
        for index in indices {
            match list.slots.get(index) {
                Some(Slot::Pending) => {
                    list.slots.remove(index);
                }
                Some(Slot::Recycled) => {
                    list.slots.insert(*index, Slot::Reissued);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn return_unissued(
        &self,
        list_id: ListId,
        indices: &[u64],
    ) -> Result<(), ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let list = state.list_mut(list_id)?;
        for index in indices {
            if let Some(slot @ (Slot::Pending | Slot::Recycled)) = list.slots.get_mut(index) {
                *slot = Slot::Freed;
                list.freed.insert(*index);
            }
        }
        Ok(())
    }

    async fn free_issued(
        &self,
        list_id: ListId,
        index: u64,
        reusable: bool,
    ) -> Result<Option<Release>, ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let list = state.list_mut(list_id)?;
        if index >= list.record.claimed {
            return Ok(None);
        }
        let release = match list.slots.entry(index) {
            Entry::Vacant(slot) if reusable => {
                slot.insert(Slot::Freed);
                list.freed.insert(index);
                Release::Reusable
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::Retired);
                Release::Retired
            }
            Entry::Occupied(mut slot) if *slot.get() == Slot::Reissued => {
                slot.insert(Slot::Retired);
                Release::Retired
            }
            Entry::Occupied(_) => return Ok(None),
        };
        Ok(Some(release))
    }

    async fn take_freed(&self, list_id: ListId, max: u64) -> Result<Vec<u64>, ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let list = state.list_mut(list_id)?;
        let mut taken = Vec::new();
        while u64::try_from(taken.len()).unwrap_or(u64::MAX) < max {
            let Some(index) = list.freed.pop_first() else {
                break;
            };
            list.slots.insert(index, Slot::Recycled);
            taken.push(index);
        }
        Ok(taken)
    }

    async fn update_status(
        &self,
        list_id: ListId,
        index: u64,
        value: u8,
    ) -> Result<u64, ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let list = state.list_mut(list_id)?;
        list.data.set(index, value)?;
        list.record.version += 1;
        Ok(list.record.version)
    }

    async fn list_data(&self, list_id: ListId) -> Result<(StatusList, u64), ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let list = state.list_mut(list_id)?;
        Ok((list.data.clone(), list.record.version))
    }

    async fn metadata(&self, list_id: ListId) -> Result<Option<ListStorageMetadata>, ServiceError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .tokens
            .get(&list_id)
            .map(|t| t.metadata.clone()))
    }

    async fn load_token(&self, list_id: ListId) -> Result<Option<StoredToken>, ServiceError> {
        self.check_available()?;
        Ok(self.state.lock().tokens.get(&list_id).cloned())
    }

    async fn store_token(
        &self,
        list_id: ListId,
        token: &[u8],
        metadata: &ListStorageMetadata,
        expected_version: u64,
    ) -> Result<(), ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let uri = state.list_mut(list_id)?.record.uri.clone();
        let found = state.tokens.get(&list_id).map_or(0, |t| t.metadata.version);
        if found != expected_version {
            return Err(ServiceError::StaleWrite {
                uri,
                expected: expected_version,
                found,
            });
        }
        state.tokens.insert(
            list_id,
            StoredToken {
                bytes: token.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let free = state
            .leases
            .get(name)
            .is_none_or(|(owner, until)| owner == holder || *until <= now);
        if free {
            state
                .leases
                .insert(name.to_string(), (holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ServiceError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.leases.get(name).is_some_and(|(owner, _)| owner == holder) {
            state.leases.remove(name);
        }
        Ok(())
    }
}
