//! In-memory event stores for tests and demos.
//!
//! - [`InMemoryEventStore`]: streams, notification log and tracking records
//!   behind one mutex, so a commit is atomic
//! - [`FlakyEventStore`]: wraps another store and fails a set number of calls
//!   with a transient error

use rehydrate_core::event::StoredEvent;
use rehydrate_core::event_store::{
    Commit, CommitAck, EventStore, EventStoreError, NotificationBatch, StoreFuture,
};
use rehydrate_core::stream::{AggregateId, Position, Version};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Log {
    /// Every committed event; index `i` holds position `i + 1`.
    notifications: Vec<StoredEvent>,
    /// Indices into `notifications`, per aggregate, in version order.
    streams: HashMap<AggregateId, Vec<usize>>,
    tracking: HashMap<(String, String), Position>,
}

impl Log {
    fn version_of(&self, reference: AggregateId) -> Version {
        Version::new(self.streams.get(&reference).map_or(0, |s| s.len() as u64))
    }

    fn max_position(&self) -> Position {
        Position::new(self.notifications.len() as u64)
    }

    fn check(&self, commit: &Commit) -> Result<(), EventStoreError> {
        for batch in &commit.batches {
            let actual = self.version_of(batch.reference);
            if actual != batch.expected_version {
                return Err(EventStoreError::ConcurrencyConflict {
                    reference: batch.reference,
                    expected: batch.expected_version,
                    actual,
                });
            }
        }
        if let Some(tracking) = &commit.tracking {
            let stored = self
                .tracking
                .get(&(tracking.follower.clone(), tracking.upstream.clone()))
                .copied()
                .unwrap_or(Position::START);
            if tracking.position <= stored {
                return Err(EventStoreError::TrackingConflict {
                    follower: tracking.follower.clone(),
                    upstream: tracking.upstream.clone(),
                    stored,
                    attempted: tracking.position,
                });
            }
        }
        Ok(())
    }

    fn apply(&mut self, commit: Commit) -> CommitAck {
        let mut versions = Vec::with_capacity(commit.batches.len());
        for batch in commit.batches {
            let resulting = batch.resulting_version();
            for event in batch.events {
                let index = self.notifications.len();
                let position = Position::new(index as u64 + 1);
                self.notifications.push(event.into_stored(batch.reference, position));
                self.streams.entry(batch.reference).or_default().push(index);
            }
            versions.push((batch.reference, resulting));
        }
        if let Some(tracking) = commit.tracking {
            self.tracking
                .insert((tracking.follower, tracking.upstream), tracking.position);
        }
        CommitAck {
            last_position: self.max_position(),
            versions,
        }
    }
}

/// Event store held entirely in memory.
///
/// Clones share the same log. All checks of a commit run before anything is
/// written, under the same lock as the write, so a rejected commit leaves no
/// trace.
///
/// # Example
///
/// ```
/// use rehydrate_core::event_store::EventStore;
/// use rehydrate_core::stream::Position;
/// use rehydrate_testing::InMemoryEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let batch = store.read_notifications(Position::START, 10).await?;
/// assert!(batch.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    log: Arc<Mutex<Log>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().notifications.len()
    }

    /// Whether nothing has been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().notifications.is_empty()
    }

    /// Every committed event, in position order.
    #[must_use]
    pub fn notifications(&self) -> Vec<StoredEvent> {
        self.lock().notifications.clone()
    }

    /// Committed events of one aggregate, in version order.
    #[must_use]
    pub fn stream(&self, reference: AggregateId) -> Vec<StoredEvent> {
        let log = self.lock();
        log.streams.get(&reference).map_or_else(Vec::new, |indices| {
            indices.iter().map(|&i| log.notifications[i].clone()).collect()
        })
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit_now(&self, commit: Commit) -> Result<CommitAck, EventStoreError> {
        commit.validate()?;
        let mut log = self.lock();
        log.check(&commit)?;
        Ok(log.apply(commit))
    }
}

impl EventStore for InMemoryEventStore {
    fn commit(&self, commit: Commit) -> StoreFuture<'_, CommitAck> {
        let result = self.commit_now(commit);
        Box::pin(std::future::ready(result))
    }

    fn read_stream(
        &self,
        reference: AggregateId,
        after: Version,
        limit: Option<usize>,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        let events = {
            let log = self.lock();
            log.streams.get(&reference).map_or_else(Vec::new, |indices| {
                indices
                    .iter()
                    .map(|&i| &log.notifications[i])
                    .filter(|e| e.version > after)
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
        };
        Box::pin(std::future::ready(Ok(events)))
    }

    fn read_notifications(&self, after: Position, limit: usize) -> StoreFuture<'_, NotificationBatch> {
        let events: Vec<StoredEvent> = {
            let log = self.lock();
            let start = usize::try_from(after.value()).unwrap_or(usize::MAX);
            log.notifications.iter().skip(start).take(limit).cloned().collect()
        };
        Box::pin(std::future::ready(Ok(NotificationBatch::new(after, events))))
    }

    fn max_position(&self) -> StoreFuture<'_, Position> {
        let position = self.lock().max_position();
        Box::pin(std::future::ready(Ok(position)))
    }

    fn tracking_position(&self, follower: &str, upstream: &str) -> StoreFuture<'_, Position> {
        let position = self
            .lock()
            .tracking
            .get(&(follower.to_string(), upstream.to_string()))
            .copied()
            .unwrap_or(Position::START);
        Box::pin(std::future::ready(Ok(position)))
    }
}

/// Event store decorator that fails the next `n` calls.
///
/// Failures are [`EventStoreError::Unavailable`], the transient kind a
/// retrying caller is expected to survive. [`lose_next_acks`] makes commits
/// land and still report `Unavailable`, as when the connection drops before
/// the acknowledgement arrives.
///
/// [`lose_next_acks`]: FlakyEventStore::lose_next_acks
#[derive(Debug)]
pub struct FlakyEventStore<S> {
    inner: Arc<S>,
    remaining: AtomicU32,
    lost_acks: AtomicU32,
    injected: AtomicU32,
}

impl<S: EventStore> FlakyEventStore<S> {
    /// Wrap a store; no failures are scheduled yet.
    #[must_use]
    pub const fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(0),
            lost_acks: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` calls, whatever they are.
    pub fn fail_next(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    /// Persist the next `n` commits but answer each with `Unavailable`.
    pub fn lose_next_acks(&self, n: u32) {
        self.lost_acks.store(n, Ordering::SeqCst);
    }

    /// How many failures were injected so far.
    #[must_use]
    pub fn failures_injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<(), EventStoreError> {
        let tripped = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            self.injected.fetch_add(1, Ordering::SeqCst);
            Err(EventStoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl<S: EventStore> EventStore for FlakyEventStore<S> {
    fn commit(&self, commit: Commit) -> StoreFuture<'_, CommitAck> {
        if let Err(e) = self.trip() {
            return Box::pin(std::future::ready(Err(e)));
        }
        let lose_ack = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !lose_ack {
            return self.inner.commit(commit);
        }
        Box::pin(async move {
            self.inner.commit(commit).await?;
            self.injected.fetch_add(1, Ordering::SeqCst);
            Err(EventStoreError::Unavailable("connection lost before acknowledgement".to_string()))
        })
    }

    fn read_stream(
        &self,
        reference: AggregateId,
        after: Version,
        limit: Option<usize>,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        match self.trip() {
            Ok(()) => self.inner.read_stream(reference, after, limit),
            Err(e) => Box::pin(std::future::ready(Err(e))),
        }
    }

    fn read_notifications(&self, after: Position, limit: usize) -> StoreFuture<'_, NotificationBatch> {
        match self.trip() {
            Ok(()) => self.inner.read_notifications(after, limit),
            Err(e) => Box::pin(std::future::ready(Err(e))),
        }
    }

    fn max_position(&self) -> StoreFuture<'_, Position> {
        match self.trip() {
            Ok(()) => self.inner.max_position(),
            Err(e) => Box::pin(std::future::ready(Err(e))),
        }
    }

    fn tracking_position(&self, follower: &str, upstream: &str) -> StoreFuture<'_, Position> {
        match self.trip() {
            Ok(()) => self.inner.tracking_position(follower, upstream),
            Err(e) => Box::pin(std::future::ready(Err(e))),
        }
    }
}
