//! Persistent list records, references and token metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ListId, PoolId};

/// A `(list uri, index)` pair binding one credential to its status slot.
///
/// Handed out exactly once per list generation. The issuer owns it from
/// then on and is responsible for status updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Reference {
    /// Public URI of the status list.
    pub uri: String,
    /// Index inside the status list.
    pub index: u64,
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(uri: impl Into<String>, index: u64) -> Self {
        Self {
            uri: uri.into(),
            index,
        }
    }
}

/// Lifecycle of a list generation.
///
/// `Active` lists hand out indices. `Frozen` lists accept only status
/// updates. `Retired` lists are frozen lists whose pool already has an
/// active successor; their tokens keep being published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListState {
    /// Accepts new allocations.
    Active,
    /// Exhausted or past its lifetime; status updates only.
    Frozen,
    /// Frozen and superseded by a successor list.
    Retired,
}

impl ListState {
    /// Returns the state as a static string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Frozen => "frozen",
            Self::Retired => "retired",
        }
    }

    /// Parses the string produced by [`ListState::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "frozen" => Some(Self::Frozen),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

/// One list generation as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRecord {
    /// List identifier.
    pub list_id: ListId,
    /// Public URI of the list.
    pub uri: String,
    /// Owning pool.
    pub pool_id: PoolId,
    /// Bits per status entry.
    pub bits: u8,
    /// Number of entries.
    pub size: u64,
    /// Persistent allocation counter: indices `0..claimed` were handed out.
    pub claimed: u64,
    /// Data version, bumped on every status update.
    pub version: u64,
    /// Lifecycle state.
    pub state: ListState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// After this instant no further indices are allocated from the list.
    pub expires_at: DateTime<Utc>,
}

impl ListRecord {
    /// Indices that can still be claimed.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.claimed)
    }

    /// `true` while no index has been claimed from the list.
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        self.claimed == 0
    }

    /// `true` if the list may still hand out indices at `now`.
    #[must_use]
    pub fn is_allocatable(&self, now: DateTime<Utc>) -> bool {
        self.state == ListState::Active && self.remaining() > 0 && now < self.expires_at
    }
}

/// Result of one atomic batch claim against a list's counter.
///
/// Covers indices `start..start + count`. A `count` of zero means the list
/// is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    /// First claimed index.
    pub start: u64,
    /// Number of claimed indices.
    pub count: u64,
}

impl Claim {
    /// Iterates over the claimed indices.
    pub fn indices(&self) -> impl Iterator<Item = u64> {
        self.start..self.start.saturating_add(self.count)
    }
}

/// What became of an issued index after its holder released it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Back in the freed set; a later claim may hand it out once more.
    Reusable,
    /// Never handed out again.
    Retired,
}

/// Metadata of the last published token of a list.
///
/// `version` increments on every republish and is used for optimistic
/// concurrency between writers. `data_version` is the list data version
/// the token was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListStorageMetadata {
    /// List identifier.
    pub list_id: ListId,
    /// Publication counter.
    pub version: u64,
    /// Data version contained in the token.
    pub data_version: u64,
    /// When the token was written.
    pub created_at: DateTime<Utc>,
    /// Token expiry (`exp` claim).
    pub expires_at: DateTime<Utc>,
}

impl ListStorageMetadata {
    /// Metadata for a list that has never been published.
    #[must_use]
    pub fn unpublished(list_id: ListId, now: DateTime<Utc>) -> Self {
        Self {
            list_id,
            version: 0,
            data_version: 0,
            created_at: now,
            expires_at: now,
        }
    }

    /// `true` if list data changed since this token was written.
    #[must_use]
    pub const fn is_outdated(&self, list_version: u64) -> bool {
        self.version == 0 || self.data_version < list_version
    }

    /// `true` if the token expires before two more update intervals pass.
    #[must_use]
    pub fn may_expire_within(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + window
    }
}

/// A published token together with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    /// Serialized signed token (compact JWS).
    pub bytes: Vec<u8>,
    /// Publication metadata.
    pub metadata: ListStorageMetadata,
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn record(claimed: u64, state: ListState) -> ListRecord {
        let now = Utc::now();
        let Ok(pool_id) = PoolId::new("p") else {
            panic!("valid pool id");
        };
        ListRecord {
            list_id: ListId::new(),
            uri: "https://status.example.com/x".to_string(),
            pool_id,
            bits: 1,
            size: 16,
            claimed,
            version: 0,
            state,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }

    #[test]
    fn remaining_and_freshness() {
        let r = record(0, ListState::Active);
        assert!(r.is_fresh());
        assert_eq!(r.remaining(), 16);
        let r = record(16, ListState::Active);
        assert_eq!(r.remaining(), 0);
        assert!(!r.is_allocatable(Utc::now()));
    }

    #[test]
    fn frozen_or_expired_lists_are_not_allocatable() {
        let r = record(3, ListState::Frozen);
        assert!(!r.is_allocatable(Utc::now()));
        let r = record(3, ListState::Active);
        assert!(!r.is_allocatable(r.expires_at));
        assert!(r.is_allocatable(r.created_at));
    }

    #[test]
    fn claim_indices_cover_range() {
        let claim = Claim { start: 4, count: 3 };
        assert_eq!(claim.indices().collect::<Vec<_>>(), vec![4, 5, 6]);
    }

    #[test]
    fn metadata_outdated_when_never_published_or_data_changed() {
        let now = Utc::now();
        let mut meta = ListStorageMetadata::unpublished(ListId::new(), now);
        assert!(meta.is_outdated(0));
        meta.version = 1;
        meta.data_version = 2;
        assert!(!meta.is_outdated(2));
        assert!(meta.is_outdated(3));
    }

    #[test]
    fn list_state_string_round_trip() {
        for state in [ListState::Active, ListState::Frozen, ListState::Retired] {
            assert_eq!(ListState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ListState::parse("gone"), None);
    }
}
