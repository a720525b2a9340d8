//! Size- and age-bounded map.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::domain::SharedClock;

struct Stored<V> {
    value: V,
    created_at: DateTime<Utc>,
    seq: u64,
}

struct MapState<K, V> {
    entries: HashMap<K, Stored<V>>,
    /// Creation order index: `(created_at, seq) -> key`.
    order: BTreeMap<(DateTime<Utc>, u64), K>,
    seq: u64,
}

impl<K: Eq + Hash + Clone, V> MapState<K, V> {
    fn remove(&mut self, key: &K) -> Option<Stored<V>> {
        let stored = self.entries.remove(key)?;
        self.order.remove(&(stored.created_at, stored.seq));
        Some(stored)
    }

    fn evict_expired(&mut self, cutoff: DateTime<Utc>) {
        while let Some((&(created_at, seq), _)) = self.order.first_key_value() {
            if created_at > cutoff {
                break;
            }
            if let Some(key) = self.order.remove(&(created_at, seq)) {
                self.entries.remove(&key);
            }
        }
    }

    fn evict_oldest(&mut self, count: usize) {
        for _ in 0..count {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
        }
    }
}

/// Map whose entries expire after `max_age` and whose size never exceeds
/// `limit`.
///
/// On overflow the oldest entries by creation time are evicted. Expired
/// entries are invisible to every lookup and dropped on the next write.
pub struct LimitedMapStorage<K, V> {
    state: Mutex<MapState<K, V>>,
    limit: usize,
    max_age: Duration,
    clock: SharedClock,
}

impl<K, V> fmt::Debug for LimitedMapStorage<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitedMapStorage")
            .field("len", &self.state.lock().entries.len())
            .field("limit", &self.limit)
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> LimitedMapStorage<K, V> {
    /// Creates an empty map.
    #[must_use]
    pub fn new(limit: usize, max_age: Duration, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MapState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                seq: 0,
            }),
            limit,
            max_age,
            clock,
        }
    }

    fn is_live(&self, stored: &Stored<V>, now: DateTime<Utc>) -> bool {
        now < stored.created_at + self.max_age
    }

    /// Inserts or replaces `key`, resetting its age.
    pub fn set(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.remove(&key);
        state.evict_expired(now - self.max_age);

        state.seq += 1;
        let seq = state.seq;
        state.order.insert((now, seq), key.clone());
        state.entries.insert(
            key,
            Stored {
                value,
                created_at: now,
                seq,
            },
        );

        let overflow = state.entries.len().saturating_sub(self.limit);
        if overflow > 0 {
            state.evict_oldest(overflow);
        }
    }

    /// Returns the value for `key` unless it is missing or expired.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|stored| self.is_live(stored, now))
            .map(|stored| stored.value.clone())
    }

    /// Removes `key`, returning its value unless it had expired.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state
            .remove(key)
            .filter(|stored| self.is_live(stored, now))
            .map(|stored| stored.value)
    }

    /// Returns the oldest live entry whose value matches `predicate`.
    pub fn find<F>(&self, mut predicate: F) -> Option<(K, V)>
    where
        F: FnMut(&V) -> bool,
    {
        let now = self.clock.now();
        let state = self.state.lock();
        state.order.values().find_map(|key| {
            let stored = state.entries.get(key)?;
            (self.is_live(stored, now) && predicate(&stored.value))
                .then(|| (key.clone(), stored.value.clone()))
        })
    }

    /// Number of stored entries, including expired ones not yet dropped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured entry limit.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }
}
