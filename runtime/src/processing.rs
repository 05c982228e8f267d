//! Policies and the per-batch processing unit.
//!
//! A [`Policy`] decides how a follower reacts to one upstream notification.
//! It reads or creates downstream aggregates through a [`ProcessingUnit`],
//! triggers events on them, and leaves the events pending. The coordinator
//! then turns the whole unit into one [`Commit`] together with the tracking
//! update, so a batch's effects and its cursor move as one. Once the commit
//! is acknowledged, the unit still holds every root at its new version, which
//! is what [`ProcessingUnit::snapshot_committed`] snapshots.

use crate::application::Application;
use crate::repository::RepositoryError;
use rehydrate_core::aggregate::{Aggregate, AggregateError, AggregateRoot};
use rehydrate_core::event::{EventError, NewEvent, StoredEvent};
use rehydrate_core::event_store::{AppendBatch, Commit, CommitAck, EventStoreError, Tracking};
use rehydrate_core::snapshot::Snapshot;
use rehydrate_core::stream::{AggregateId, Version};
use rehydrate_core::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors a policy can return.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// Loading or saving a downstream aggregate failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// A downstream aggregate rejected the event the policy triggered.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// The upstream event could not be decoded.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The same reference was requested as two different aggregate kinds.
    #[error("Aggregate {reference} is cached as another kind than {requested}")]
    KindMismatch {
        /// The reference.
        reference: AggregateId,
        /// Kind requested the second time.
        requested: &'static str,
    },

    /// A domain rule refused the notification.
    #[error("Policy failed: {0}")]
    Failed(String),
}

impl PolicyError {
    /// Whether the follower must stop instead of retrying.
    ///
    /// An event type nobody registered, or a payload schema newer than this
    /// deployment, means it cannot read its upstream. Retrying or skipping
    /// would silently lose data.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Event(EventError::UnknownEventType(_) | EventError::UnsupportedSchema { .. }) => true,
            Self::Repository(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// The storage error behind this failure, if it is worth retrying later.
    ///
    /// Such a failure says nothing about the notification, so the follower
    /// backs off instead of counting it towards poison.
    #[must_use]
    pub const fn transient_storage(&self) -> Option<&EventStoreError> {
        match self {
            Self::Repository(RepositoryError::Storage(e)) if e.is_transient() => Some(e),
            _ => None,
        }
    }
}

/// Boxed future returned by [`Policy::process`].
pub type PolicyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PolicyError>> + Send + 'a>>;

/// How a follower reacts to upstream notifications.
///
/// Implementations decode the events they care about and return `Ok(())`
/// for everything else:
///
/// ```ignore
/// impl Policy for Counters {
///     fn process<'a>(
///         &'a self,
///         _upstream: &'a str,
///         event: &'a StoredEvent,
///         unit: &'a mut ProcessingUnit,
///     ) -> PolicyFuture<'a> {
///         Box::pin(async move {
///             if event.kind != Dog::KIND {
///                 return Ok(());
///             }
///             match event.decode::<DogEvent>()? {
///                 DogEvent::TrickAdded { trick } => increment(unit, &trick).await,
///                 _ => Ok(()),
///             }
///         })
///     }
/// }
/// ```
///
/// A policy must be deterministic given the notification and the downstream
/// state, because an aborted batch is processed again from the start.
pub trait Policy: Send + Sync {
    /// React to one notification.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the batch. Fatal errors (see
    /// [`PolicyError::is_fatal`]) stop the follower.
    fn process<'a>(
        &'a self,
        upstream: &'a str,
        event: &'a StoredEvent,
        unit: &'a mut ProcessingUnit,
    ) -> PolicyFuture<'a>;
}

trait PendingRoot: Send + Sync {
    fn kind(&self) -> &'static str;
    fn reference(&self) -> AggregateId;
    fn version(&self) -> Version;
    fn committed_version(&self) -> Version;
    fn to_snapshot(&self, now: DateTime<Utc>) -> Result<Snapshot, EventError>;
    fn take_pending(&mut self) -> Vec<NewEvent>;
    fn pending_len(&self) -> usize;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<A: Aggregate> PendingRoot for AggregateRoot<A> {
    fn kind(&self) -> &'static str {
        A::KIND
    }

    fn reference(&self) -> AggregateId {
        Self::reference(self)
    }

    fn version(&self) -> Version {
        Self::version(self)
    }

    fn committed_version(&self) -> Version {
        Self::committed_version(self)
    }

    fn to_snapshot(&self, now: DateTime<Utc>) -> Result<Snapshot, EventError> {
        Self::to_snapshot(self, now)
    }

    fn take_pending(&mut self) -> Vec<NewEvent> {
        Self::take_pending(self)
    }

    fn pending_len(&self) -> usize {
        self.pending().len()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Working set of downstream aggregates for one batch.
///
/// Aggregates are loaded at most once per batch. Asking for the same
/// reference again returns the cached root with its pending events, so two
/// notifications touching one downstream aggregate build on each other.
pub struct ProcessingUnit {
    app: Application,
    roots: HashMap<AggregateId, Box<dyn PendingRoot>>,
    order: Vec<AggregateId>,
}

impl ProcessingUnit {
    /// Start an empty unit over the downstream application.
    #[must_use]
    pub fn new(app: Application) -> Self {
        Self {
            app,
            roots: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// The downstream application.
    #[must_use]
    pub const fn application(&self) -> &Application {
        &self.app
    }

    /// Current time from the application's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.app.clock().now()
    }

    /// Load a downstream aggregate, or return the cached one.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Repository`] if it does not exist or cannot be loaded
    /// - [`PolicyError::KindMismatch`] if the reference is cached as another kind
    pub async fn get<A: Aggregate>(
        &mut self,
        reference: AggregateId,
    ) -> Result<&mut AggregateRoot<A>, PolicyError> {
        if !self.roots.contains_key(&reference) {
            let root = self.app.repository::<A>().get(reference).await?;
            self.insert(reference, root);
        }
        self.cached(reference)
    }

    /// Load a downstream aggregate, or create it with `factory` if it does
    /// not exist yet.
    ///
    /// The created root is only committed with the batch.
    ///
    /// # Errors
    ///
    /// As [`ProcessingUnit::get`], plus [`PolicyError::Aggregate`] if the
    /// factory's event is not a creation event.
    pub async fn get_or_create<A, F>(
        &mut self,
        reference: AggregateId,
        factory: F,
    ) -> Result<&mut AggregateRoot<A>, PolicyError>
    where
        A: Aggregate,
        F: FnOnce() -> A::Event,
    {
        if !self.roots.contains_key(&reference) {
            let root = match self.app.repository::<A>().get(reference).await {
                Ok(root) => root,
                Err(RepositoryError::AggregateNotFound(_)) => {
                    AggregateRoot::<A>::create(reference, factory(), self.now())?
                }
                Err(e) => return Err(e.into()),
            };
            self.insert(reference, root);
        }
        self.cached(reference)
    }

    /// Number of events pending across the unit.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.roots.values().map(|r| r.pending_len()).sum()
    }

    /// Turn the unit into one commit carrying `tracking`.
    ///
    /// Aggregates without pending events are left out; the commit may carry
    /// tracking only.
    #[must_use]
    pub fn into_commit(mut self, tracking: Tracking) -> Commit {
        self.take_commit(tracking)
    }

    /// Move every pending event into one commit carrying `tracking`.
    ///
    /// The roots stay in the unit at their new versions, so after the commit
    /// succeeds [`ProcessingUnit::snapshot_committed`] can snapshot them. If
    /// the commit fails the unit must be dropped.
    pub fn take_commit(&mut self, tracking: Tracking) -> Commit {
        let mut batches = Vec::new();
        for reference in &self.order {
            if let Some(root) = self.roots.get_mut(reference) {
                let expected = root.committed_version();
                let events = root.take_pending();
                if !events.is_empty() {
                    tracing::trace!(kind = root.kind(), reference = %reference, events = events.len(), "Batch staged");
                    batches.push(AppendBatch::new(*reference, expected, events));
                }
            }
        }
        Commit {
            batches,
            tracking: Some(tracking),
        }
    }

    /// Snapshot every root the acknowledged commit moved onto its kind's
    /// snapshot interval.
    ///
    /// Returns the number of snapshots written. Write failures are logged by
    /// the application and do not undo the commit.
    pub async fn snapshot_committed(&self, ack: &CommitAck) -> usize {
        let mut written = 0;
        for reference in &self.order {
            let Some(root) = self.roots.get(reference) else {
                continue;
            };
            if ack.version_of(*reference) != Some(root.version()) {
                continue;
            }
            if self
                .app
                .snapshot_if_due(root.kind(), root.reference(), root.version(), |now| root.to_snapshot(now))
                .await
            {
                written += 1;
            }
        }
        written
    }

    fn insert<A: Aggregate>(&mut self, reference: AggregateId, root: AggregateRoot<A>) {
        self.order.push(reference);
        self.roots.insert(reference, Box::new(root));
    }

    fn cached<A: Aggregate>(&mut self, reference: AggregateId) -> Result<&mut AggregateRoot<A>, PolicyError> {
        self.roots
            .get_mut(&reference)
            .and_then(|root| root.as_any_mut().downcast_mut::<AggregateRoot<A>>())
            .ok_or(PolicyError::KindMismatch {
                reference,
                requested: A::KIND,
            })
    }
}
