//! Aggregate identification, versioning and notification positions.
//!
//! This module defines the strong types used to address events:
//!
//! - [`AggregateId`]: the stable reference of one aggregate instance
//! - [`Version`]: the per-aggregate, gap-free event counter
//! - [`Position`]: the per-application global notification order

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for `AggregateId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid aggregate ID: {0}")]
pub struct ParseAggregateIdError(String);

/// Unique reference of an aggregate instance.
///
/// References are UUIDs. Aggregates that have a natural key (a dog's name, a
/// counter's label) derive their reference deterministically with
/// [`AggregateId::from_natural_key`], which makes "create if absent" idempotent:
/// every caller computes the same reference for the same key.
///
/// # Examples
///
/// ```
/// use rehydrate_core::stream::AggregateId;
///
/// let a = AggregateId::from_natural_key("dogs", "Fido");
/// let b = AggregateId::from_natural_key("dogs", "Fido");
/// assert_eq!(a, b);
///
/// let parsed: AggregateId = a.to_string().parse().unwrap();
/// assert_eq!(parsed, a);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateId(Uuid);

impl AggregateId {
    /// Wrap an existing UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Derive a reference from a natural key.
    ///
    /// The reference is the UUIDv5 (URL namespace) of `"/{kind_path}/{key}"`,
    /// so `from_natural_key("dogs", "Fido")` hashes `/dogs/Fido`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rehydrate_core::stream::AggregateId;
    ///
    /// let dog = AggregateId::from_natural_key("dogs", "Fido");
    /// let counter = AggregateId::from_natural_key("counters", "Fido");
    /// assert_ne!(dog, counter);
    /// ```
    #[must_use]
    pub fn from_natural_key(kind_path: &str, key: &str) -> Self {
        let name = format!("/{kind_path}/{key}");
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }

    /// Generate a random reference (for aggregates without a natural key).
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Convert into the underlying UUID.
    #[must_use]
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for AggregateId {
    type Err = ParseAggregateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ParseAggregateIdError(format!("{s}: {e}")))
    }
}

impl From<Uuid> for AggregateId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<AggregateId> for Uuid {
    fn from(id: AggregateId) -> Self {
        id.0
    }
}

/// Event version number for optimistic concurrency control.
///
/// Version 0 ([`Version::INITIAL`]) means "no events yet". The creation event
/// carries version 1 and every later event carries exactly the previous
/// version plus one:
///
/// - When appending events, the writer states the version it loaded
/// - If the stream has moved on, the append fails
/// - Versions are never skipped, reused or decreased
///
/// # Examples
///
/// ```
/// use rehydrate_core::stream::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert_eq!(v1.value(), 1);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of an aggregate that has no committed events.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the initial version (0).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }

    /// Check whether this version lands on a snapshot boundary.
    ///
    /// Always false for the initial version and for an interval of zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use rehydrate_core::stream::Version;
    ///
    /// assert!(Version::new(20).is_multiple_of(10));
    /// assert!(!Version::new(21).is_multiple_of(10));
    /// assert!(!Version::new(0).is_multiple_of(10));
    /// ```
    #[must_use]
    pub const fn is_multiple_of(self, interval: u64) -> bool {
        interval != 0 && self.0 != 0 && self.0 % interval == 0
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

impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Arithmetic subtraction for `Version`.
///
/// Caller is responsible for ensuring subtraction doesn't underflow below 0.
impl std::ops::Sub<u64> for Version {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// Position in an application's global notification sequence.
///
/// Every committed event receives a position that is strictly greater than
/// the position of every event committed before it in the same application.
/// Position 0 ([`Position::START`]) is "before the first notification", so a
/// follower with no tracking record reads from `Position::START`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(u64);

impl Position {
    /// The position before any notification.
    pub const START: Self = Self(0);

    /// Create a new `Position`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the position number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The position immediately after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Position> for u64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod aggregate_id_tests {
        use super::*;

        #[test]
        fn natural_key_is_deterministic() {
            let a = AggregateId::from_natural_key("dogs", "Fido");
            let b = AggregateId::from_natural_key("dogs", "Fido");
            assert_eq!(a, b);
        }

        #[test]
        fn natural_key_is_namespaced_by_kind() {
            let dog = AggregateId::from_natural_key("dogs", "Fido");
            let counter = AggregateId::from_natural_key("counters", "Fido");
            assert_ne!(dog, counter);
        }

        #[test]
        fn natural_key_matches_uuid_v5_of_url_path() {
            let expected = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"/dogs/Fido");
            assert_eq!(
                AggregateId::from_natural_key("dogs", "Fido").into_inner(),
                expected
            );
        }

        #[test]
        fn random_ids_differ() {
            assert_ne!(AggregateId::random(), AggregateId::random());
        }

        #[test]
        #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
        fn display_parse_roundtrip() {
            let id = AggregateId::from_natural_key("counters", "roll over");
            let parsed: AggregateId = id.to_string().parse().expect("parse should succeed");
            assert_eq!(parsed, id);
        }

        #[test]
        fn parse_garbage_fails() {
            assert!("not-a-uuid".parse::<AggregateId>().is_err());
            assert!("".parse::<AggregateId>().is_err());
        }
    }

    mod version_tests {
        use super::*;

        #[test]
        fn initial_version() {
            assert_eq!(Version::INITIAL, Version::new(0));
            assert!(Version::INITIAL.is_initial());
            assert!(!Version::new(1).is_initial());
        }

        #[test]
        fn next_version() {
            let v1 = Version::INITIAL.next();
            assert_eq!(v1, Version::new(1));
            assert_eq!(v1.next(), Version::new(2));
        }

        #[test]
        fn version_arithmetic() {
            let v5 = Version::new(5);
            assert_eq!(v5 + 3, Version::new(8));
            assert_eq!(v5 - 2, Version::new(3));
        }

        #[test]
        fn snapshot_boundaries() {
            assert!(Version::new(2).is_multiple_of(2));
            assert!(Version::new(100).is_multiple_of(100));
            assert!(!Version::new(99).is_multiple_of(100));
            assert!(!Version::new(4).is_multiple_of(0));
            assert!(!Version::INITIAL.is_multiple_of(1));
        }

        #[test]
        fn version_from_u64() {
            let version = Version::from(42_u64);
            let num: u64 = version.into();
            assert_eq!(num, 42);
        }
    }

    mod position_tests {
        use super::*;

        #[test]
        fn start_is_zero() {
            assert_eq!(Position::START.value(), 0);
            assert_eq!(Position::default(), Position::START);
        }

        #[test]
        fn ordering() {
            assert!(Position::new(1) < Position::new(2));
            assert_eq!(Position::new(7).next(), Position::new(8));
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", Position::new(42)), "42");
        }
    }
}
