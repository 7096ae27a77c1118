//! Entity identity and version types.
//!
//! Every replicated record (a ticket, an order) is identified by an
//! [`EntityId`] and carries a [`Version`]. The version is owned by the
//! authoritative service: it starts at [`Version::INITIAL`] when the entity is
//! created and grows by exactly one with every published change. Consumers use
//! it to reject stale or duplicated updates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `EntityId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid entity ID: {0}")]
pub struct ParseEntityIdError(String);

/// Identifier of a replicated entity.
///
/// `FromStr` rejects empty strings and should be used for external input.
/// `new()` and `From` do not validate and are meant for trusted values.
///
/// # Examples
///
/// ```
/// use ticketbus_core::entity::EntityId;
///
/// let id = EntityId::new("T1");
/// assert_eq!(id.as_str(), "T1");
///
/// let parsed: EntityId = "T1".parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new `EntityId`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = ParseEntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseEntityIdError("Entity ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Monotonically increasing per-entity version.
///
/// Serialized as a bare integer so other services can read it.
///
/// # Examples
///
/// ```
/// use ticketbus_core::entity::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Some(Version::new(1)));
/// assert_eq!(Version::new(u64::MAX).next(), None);
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version of a freshly created entity.
    pub const INITIAL: Self = Self(0);

    /// Create a version from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version that follows this one, or `None` at `u64::MAX`.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// Whether this is [`Version::INITIAL`].
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}
