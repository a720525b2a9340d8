//! Anti-replay ledger with per-key expiry.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::SharedClock;
use crate::error::ServiceError;

/// Heap entry ordered by expiry only, so keys need not be `Ord`.
struct Expiry<K> {
    valid_until: DateTime<Utc>,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Expiry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.valid_until == other.valid_until && self.seq == other.seq
    }
}

impl<K> Eq for Expiry<K> {}

impl<K> PartialOrd for Expiry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Expiry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.valid_until
            .cmp(&other.valid_until)
            .then(self.seq.cmp(&other.seq))
    }
}

struct LedgerState<K> {
    /// Live keys with the sequence number of their current heap entry.
    seen: HashMap<K, u64>,
    expiry: BinaryHeap<Reverse<Expiry<K>>>,
    seq: u64,
}

impl<K: Eq + Hash> LedgerState<K> {
    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(head)) = self.expiry.peek() {
            if head.valid_until > now {
                break;
            }
            if let Some(Reverse(expired)) = self.expiry.pop()
                && self.seen.get(&expired.key) == Some(&expired.seq)
            {
                self.seen.remove(&expired.key);
            }
        }
    }
}

/// Bounded set of keys, each remembered until its `valid_until`.
///
/// Used for request id replay protection. All operations
/// lock the ledger once and prune expired keys inline, so no background
/// task is needed.
///
/// The ledger is fail-closed: when it is full, unknown keys are reported
/// as used. Each such rejection is counted and logged.
pub struct ExpiringLedger<K> {
    state: Mutex<LedgerState<K>>,
    capacity: usize,
    clock: SharedClock,
    rejected: AtomicU64,
}

impl<K> fmt::Debug for ExpiringLedger<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringLedger")
            .field("len", &self.state.lock().seen.len())
            .field("capacity", &self.capacity)
            .field("rejected", &self.rejected.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl<K: Eq + Hash + Clone> ExpiringLedger<K> {
    /// Creates a ledger holding at most `capacity` live keys.
    #[must_use]
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                seen: HashMap::new(),
                expiry: BinaryHeap::new(),
                seq: 0,
            }),
            capacity,
            clock,
            rejected: AtomicU64::new(0),
        }
    }

    /// Returns `true` the first time `key` is presented and `false` for
    /// every later presentation before `valid_until`.
    ///
    /// Once `valid_until` has passed the key is forgotten and the next
    /// presentation returns `true` again. A full ledger returns `false`.
    pub fn is_unused(&self, key: K, valid_until: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now);

        if state.seen.contains_key(&key) {
            return false;
        }
        if state.seen.len() >= self.capacity {
            drop(state);
            let rejected = self.rejected.fetch_add(1, AtomicOrdering::Relaxed) + 1;
            tracing::warn!(
                error = %ServiceError::CapacityExceeded(self.capacity),
                rejected,
                "ledger full, treating key as used"
            );
            return false;
        }

        state.seq += 1;
        let seq = state.seq;
        state.seen.insert(key.clone(), seq);
        state.expiry.push(Reverse(Expiry {
            valid_until,
            seq,
            key,
        }));
        true
    }

    /// Removes `key` so its next presentation is accepted again. Returns
    /// whether the key was live.
    ///
    /// Lets a caller release a key whose request failed before taking
    /// effect.
    pub fn forget(&self, key: &K) -> bool {
        self.state.lock().seen.remove(key).is_some()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now);
        state.seen.len()
    }

    /// `true` if the ledger holds no live key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of live keys.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys rejected because the ledger was full.
    #[must_use]
    pub fn rejected_at_capacity(&self) -> u64 {
        self.rejected.load(AtomicOrdering::Relaxed)
    }
}
