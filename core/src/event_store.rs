//! Event store trait and related types for event sourcing.
//!
//! An event store is the single source of truth of an application. It keeps
//! one append-only stream per aggregate and one global notification sequence
//! across all of them.
//!
//! # Design
//!
//! The `EventStore` trait provides exactly what the kernel needs:
//!
//! - Commit events with per-aggregate optimistic concurrency
//! - Read one aggregate's stream for state reconstruction
//! - Read the global notification sequence for followers
//! - Keep follower tracking records, advanced atomically with a commit
//!
//! [`EventStore::commit`] is the only write primitive. A [`Commit`] can hold
//! several aggregates' batches and an optional [`Tracking`] update; either all
//! of it becomes visible or none of it does.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `rehydrate-postgres`): production implementation
//! - `InMemoryEventStore` (in `rehydrate-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use rehydrate_core::event_store::{EventStore, EventStoreError};
//! use rehydrate_core::stream::{AggregateId, Position, Version};
//!
//! async fn example<E: EventStore>(store: &E) -> Result<(), EventStoreError> {
//!     let reference = AggregateId::from_natural_key("dogs", "Fido");
//!
//!     // Append with optimistic concurrency
//!     let events = vec![/* ... */];
//!     store.append(reference, Version::INITIAL, events).await?;
//!
//!     // Reconstruct state
//!     let history = store.read_stream(reference, Version::INITIAL, None).await?;
//!
//!     // Follow the application
//!     let batch = store.read_notifications(Position::START, 100).await?;
//!     Ok(())
//! }
//! ```

use crate::event::{NewEvent, StoredEvent};
use crate::stream::{AggregateId, Position, Version};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by the store traits.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: expected version doesn't match current version.
    ///
    /// Another writer committed to this aggregate since it was loaded. The
    /// caller must reload and reapply its command.
    #[error("Concurrency conflict on {reference}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate where the conflict occurred.
        reference: AggregateId,
        /// The version the writer expected the aggregate to be at.
        expected: Version,
        /// The actual current version of the aggregate.
        actual: Version,
    },

    /// The tracking update does not move the follower's cursor forward.
    ///
    /// The notifications up to `stored` were already committed, so the batch
    /// that carries this update is a redelivery.
    #[error(
        "Tracking conflict for {follower} following {upstream}: stored position {stored}, attempted {attempted}"
    )]
    TrackingConflict {
        /// The follower name.
        follower: String,
        /// The upstream application name.
        upstream: String,
        /// Position already recorded.
        stored: Position,
        /// Position the commit tried to record.
        attempted: Position,
    },

    /// The commit is malformed (non-contiguous versions, duplicate references).
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Transient transport failure (connection dropped, pool timeout).
    ///
    /// Safe to retry with backoff.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// Database error that retrying will not fix.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EventStoreError {
    /// Whether the operation may succeed if simply retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Events for one aggregate, appended under its optimistic concurrency rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendBatch {
    /// The aggregate the events belong to.
    pub reference: AggregateId,
    /// The aggregate's version before this batch.
    pub expected_version: Version,
    /// Events with versions `expected_version + 1 ..= expected_version + len`.
    pub events: Vec<NewEvent>,
}

impl AppendBatch {
    /// Create a batch.
    #[must_use]
    pub const fn new(reference: AggregateId, expected_version: Version, events: Vec<NewEvent>) -> Self {
        Self {
            reference,
            expected_version,
            events,
        }
    }

    /// The version the aggregate reaches once the batch is committed.
    #[must_use]
    pub fn resulting_version(&self) -> Version {
        self.expected_version + self.events.len() as u64
    }

    /// Check that the events carry contiguous versions starting right after
    /// `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::InvalidBatch` describing the first offending event.
    pub fn validate(&self) -> Result<(), EventStoreError> {
        let mut expected = self.expected_version;
        for event in &self.events {
            expected = expected.next();
            if event.version != expected {
                return Err(EventStoreError::InvalidBatch(format!(
                    "event {} for {} has version {}, expected {expected}",
                    event.event_type, self.reference, event.version
                )));
            }
        }
        Ok(())
    }
}

/// A follower's cursor into an upstream application's notification sequence.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tracking {
    /// Follower (process application) name.
    pub follower: String,
    /// Upstream application name.
    pub upstream: String,
    /// Highest notification position fully processed.
    pub position: Position,
}

impl Tracking {
    /// Create a tracking record.
    #[must_use]
    pub fn new(follower: impl Into<String>, upstream: impl Into<String>, position: Position) -> Self {
        Self {
            follower: follower.into(),
            upstream: upstream.into(),
            position,
        }
    }
}

/// One atomic unit of writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Commit {
    /// Per-aggregate batches, at most one per reference.
    pub batches: Vec<AppendBatch>,
    /// Optional follower cursor advanced in the same unit.
    pub tracking: Option<Tracking>,
}

impl Commit {
    /// A commit with a single aggregate batch and no tracking.
    #[must_use]
    pub fn single(batch: AppendBatch) -> Self {
        Self {
            batches: vec![batch],
            tracking: None,
        }
    }

    /// A commit that only advances a tracking record.
    #[must_use]
    pub const fn tracking_only(tracking: Tracking) -> Self {
        Self {
            batches: Vec::new(),
            tracking: Some(tracking),
        }
    }

    /// Total number of events in the commit.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.batches.iter().map(|b| b.events.len()).sum()
    }

    /// Whether the commit writes nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracking.is_none() && self.event_count() == 0
    }

    /// Validate the shape of the commit without looking at stored state.
    ///
    /// Every store implementation calls this before taking any lock.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::InvalidBatch` if a batch has non-contiguous
    /// versions or two batches target the same aggregate.
    pub fn validate(&self) -> Result<(), EventStoreError> {
        let mut seen = HashSet::with_capacity(self.batches.len());
        for batch in &self.batches {
            if !seen.insert(batch.reference) {
                return Err(EventStoreError::InvalidBatch(format!(
                    "aggregate {} appears in more than one batch",
                    batch.reference
                )));
            }
            batch.validate()?;
        }
        Ok(())
    }
}

/// Acknowledgement of a successful commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitAck {
    /// Position of the last event written, or the previous maximum if the
    /// commit carried no events.
    pub last_position: Position,
    /// New version of every aggregate written.
    pub versions: Vec<(AggregateId, Version)>,
}

impl CommitAck {
    /// The new version of one aggregate, if the commit wrote to it.
    #[must_use]
    pub fn version_of(&self, reference: AggregateId) -> Option<Version> {
        self.versions
            .iter()
            .find(|(r, _)| *r == reference)
            .map(|(_, v)| *v)
    }
}

/// A page of the notification sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotificationBatch {
    /// Events in ascending position order.
    pub events: Vec<StoredEvent>,
    /// Position to read after next time (the last event's position, or the
    /// requested position if the page is empty).
    pub next_position: Position,
}

impl NotificationBatch {
    /// Build a page, computing `next_position`.
    #[must_use]
    pub fn new(after: Position, events: Vec<StoredEvent>) -> Self {
        let next_position = events.last().map_or(after, |e| e.position);
        Self {
            events,
            next_position,
        }
    }

    /// Whether the page holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Event store abstraction for one application.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one store is shared by every
/// concurrent command and follower of the application. No global lock is
/// implied: correctness relies on the per-aggregate version check.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventStore>`).
pub trait EventStore: Send + Sync {
    /// Atomically commit aggregate batches and an optional tracking update.
    ///
    /// For every batch, the stored version of its aggregate must equal the
    /// batch's `expected_version`. If a tracking update is present it must be
    /// strictly ahead of the stored position for its (follower, upstream) pair.
    /// Events receive consecutive notification positions in batch order.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: an aggregate moved on since it was loaded
    /// - `TrackingConflict`: the tracking update is not ahead of the stored one
    /// - `InvalidBatch`: the commit is malformed
    /// - `Unavailable` / `DatabaseError`: storage failure
    ///
    /// Nothing is persisted when an error is returned.
    fn commit(&self, commit: Commit) -> StoreFuture<'_, CommitAck>;

    /// Append events to one aggregate with optimistic concurrency control.
    ///
    /// Convenience wrapper over [`commit`](EventStore::commit).
    ///
    /// # Errors
    ///
    /// See [`commit`](EventStore::commit).
    fn append(
        &self,
        reference: AggregateId,
        expected_version: Version,
        events: Vec<NewEvent>,
    ) -> StoreFuture<'_, CommitAck> {
        self.commit(Commit::single(AppendBatch::new(
            reference,
            expected_version,
            events,
        )))
    }

    /// Load events of one aggregate with version greater than `after`.
    ///
    /// Returns events in ascending version order, at most `limit` of them. An
    /// unknown aggregate yields an empty vector, not an error.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn read_stream(
        &self,
        reference: AggregateId,
        after: Version,
        limit: Option<usize>,
    ) -> StoreFuture<'_, Vec<StoredEvent>>;

    /// Load up to `limit` notifications with position greater than `after`.
    ///
    /// Notifications come in ascending position order. Within one call no
    /// position is returned twice and no committed position is skipped.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn read_notifications(&self, after: Position, limit: usize) -> StoreFuture<'_, NotificationBatch>;

    /// The highest notification position committed so far.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn max_position(&self) -> StoreFuture<'_, Position>;

    /// The tracking position of a (follower, upstream) pair.
    ///
    /// Returns [`Position::START`] if the pair has never committed.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn tracking_position(&self, follower: &str, upstream: &str) -> StoreFuture<'_, Position>;
}
