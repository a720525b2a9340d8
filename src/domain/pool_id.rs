//! Type-safe pool and list identifiers.
//!
//! [`PoolId`] is a validated newtype over the configured pool name and
//! [`ListId`] wraps the [`uuid::Uuid`] (v4) of one list generation, so the
//! two cannot be confused with each other or with arbitrary strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Identifier of a status list pool.
///
/// Pool ids come from configuration and must match `[a-z0-9_-]+`. They are
/// used as the key in [`super::PoolRegistry`], in lease names and in the
/// `/pools/{pool_id}/new-references` path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PoolId(String);

impl PoolId {
    /// Creates a `PoolId` after validating its characters.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] if the id is empty or contains
    /// characters outside `[a-z0-9_-]`.
    pub fn new(id: impl Into<String>) -> Result<Self, ServiceError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(id))
        } else {
            Err(ServiceError::Config(format!("invalid pool id {id:?}")))
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PoolId {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PoolId {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PoolId> for String {
    fn from(id: PoolId) -> Self {
        id.0
    }
}

/// Identifier of one status list generation.
///
/// Generated once when the list is created. The public list URI is
/// `{public_url}/{list_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListId(uuid::Uuid);

impl ListId {
    /// Creates a new random `ListId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a `ListId` from an existing [`uuid::Uuid`].
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Extracts the list id from the last path segment of a list URI.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ListNotFound`] if the URI does not end in a
    /// UUID.
    pub fn from_uri(uri: &str) -> Result<Self, ServiceError> {
        uri.rsplit('/')
            .next()
            .and_then(|segment| segment.parse::<uuid::Uuid>().ok())
            .map(Self)
            .ok_or_else(|| ServiceError::ListNotFound(uri.to_string()))
    }

    /// Builds the public URI of this list under `public_url`.
    #[must_use]
    pub fn uri(&self, public_url: &str) -> String {
        format!("{}/{}", public_url.trim_end_matches('/'), self.0)
    }
}

impl Default for ListId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for ListId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}
