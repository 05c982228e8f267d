//! Loading and saving aggregates.
//!
//! A [`Repository`] composes the snapshot store, the event store and the
//! replay fold into "current state of aggregate X".
//!
//! # Loading
//!
//! 1. Load the latest snapshot, if snapshots are enabled
//! 2. Read the events after the snapshot's version
//! 3. Fold them onto the snapshot (or from nothing)
//!
//! A snapshot that fails to load or restore is ignored and the aggregate is
//! replayed from its first event. Snapshots only ever change replay cost.
//!
//! # Saving
//!
//! [`Repository::save`] appends the root's pending events under the version
//! they were produced from. A conflict is returned to the caller, who must
//! reload and reapply the command. The repository never retries on its own.

use crate::application::Application;
use crate::metrics::RepositoryMetrics;
use rehydrate_core::aggregate::{Aggregate, AggregateError, AggregateRoot, MutationError, NaturalKey};
use rehydrate_core::event::{EventError, StoredEvent};
use rehydrate_core::event_store::{AppendBatch, Commit, CommitAck, EventStoreError};
use rehydrate_core::registry::RegistryError;
use rehydrate_core::replay::{self, ReplayError};
use rehydrate_core::snapshot::Snapshot;
use rehydrate_core::stream::{AggregateId, Version};
use std::marker::PhantomData;
use thiserror::Error;

/// Errors returned by repository operations.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// No snapshot and no events exist for the reference.
    #[error("Aggregate not found: {0}")]
    AggregateNotFound(AggregateId),

    /// The aggregate exists but has not reached the requested version.
    #[error("Aggregate {reference} is at version {latest}, version {requested} does not exist")]
    VersionNotFound {
        /// The aggregate.
        reference: AggregateId,
        /// Version asked for.
        requested: Version,
        /// Latest committed version.
        latest: Version,
    },

    /// Another writer committed to the aggregate since it was loaded.
    #[error("Concurrency conflict on {reference}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate.
        reference: AggregateId,
        /// Version the save was based on.
        expected: Version,
        /// Version found in the store.
        actual: Version,
    },

    /// The aggregate kind is not in the application's registry.
    #[error("Aggregate kind {0} is not registered")]
    UnknownKind(String),

    /// A stored event carries a tag this deployment does not know.
    #[error("Unknown event type {event_type} for aggregate kind {kind}")]
    UnknownEventType {
        /// Aggregate kind.
        kind: String,
        /// The unknown tag.
        event_type: String,
    },

    /// A stored event was written under a schema this deployment cannot read.
    #[error("Cannot read {event_type} for aggregate kind {kind}: schema {found}, current {current}")]
    UnsupportedSchema {
        /// Aggregate kind.
        kind: String,
        /// The stored tag.
        event_type: String,
        /// Schema version of the stored payload.
        found: u32,
        /// Schema version this deployment writes.
        current: u32,
    },

    /// The mutation engine rejected an event.
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// The stored stream is inconsistent.
    #[error("Replay failed: {0}")]
    Replay(ReplayError),

    /// Snapshots are not configured for this application.
    #[error("Snapshots are disabled for application {0}")]
    SnapshotsDisabled(String),

    /// Storage failure.
    #[error("Storage error: {0}")]
    Storage(EventStoreError),

    /// An event or snapshot could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    /// Whether the error is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Whether the error means the deployment cannot read its own data.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownEventType { .. } | Self::UnsupportedSchema { .. } | Self::UnknownKind(_)
        )
    }

    fn from_replay(kind: &str, err: ReplayError) -> Self {
        match err {
            ReplayError::Event(EventError::UnknownEventType(event_type)) => Self::UnknownEventType {
                kind: kind.to_string(),
                event_type,
            },
            ReplayError::Event(EventError::UnsupportedSchema {
                event_type,
                found,
                current,
            }) => Self::UnsupportedSchema {
                kind: kind.to_string(),
                event_type,
                found,
                current,
            },
            ReplayError::Event(e) => Self::Serialization(e.to_string()),
            ReplayError::Mutation(e) => Self::Mutation(e),
            other => Self::Replay(other),
        }
    }
}

impl From<EventStoreError> for RepositoryError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::ConcurrencyConflict {
                reference,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                reference,
                expected,
                actual,
            },
            EventStoreError::SerializationError(e) => Self::Serialization(e),
            other => Self::Storage(other),
        }
    }
}

impl From<RegistryError> for RepositoryError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownEventType { kind, event_type } => {
                Self::UnknownEventType { kind, event_type }
            }
            RegistryError::UnknownKind(kind) => Self::UnknownKind(kind),
            other => Self::Serialization(other.to_string()),
        }
    }
}

impl From<AggregateError> for RepositoryError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::Mutation(e) => Self::Mutation(e),
            AggregateError::Event(e) => Self::Serialization(e.to_string()),
        }
    }
}

/// Repository for one aggregate kind of one application.
pub struct Repository<A> {
    app: Application,
    _kind: PhantomData<fn() -> A>,
}

impl<A> Clone for Repository<A> {
    fn clone(&self) -> Self {
        Self {
            app: self.app.clone(),
            _kind: PhantomData,
        }
    }
}

impl<A: Aggregate> Repository<A> {
    /// Create a repository over an application.
    #[must_use]
    pub const fn new(app: Application) -> Self {
        Self {
            app,
            _kind: PhantomData,
        }
    }

    /// Load the current state of an aggregate.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::AggregateNotFound`] if nothing was ever committed
    /// - [`RepositoryError::UnknownEventType`] if a stored event is not registered
    /// - [`RepositoryError::Storage`] on storage failure
    pub async fn get(&self, reference: AggregateId) -> Result<AggregateRoot<A>, RepositoryError> {
        let seed = self.load_seed(reference, None).await;
        self.replay(reference, seed, None).await
    }

    /// Load the state of an aggregate as it was at `version`.
    ///
    /// Uses the newest snapshot at or below `version`, so later snapshots
    /// never leak into the result.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::VersionNotFound`] if the aggregate never reached `version`
    /// - otherwise as [`Repository::get`]
    pub async fn get_at_version(
        &self,
        reference: AggregateId,
        version: Version,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        if version.is_initial() {
            return Err(RepositoryError::AggregateNotFound(reference));
        }

        let seed = self.load_seed(reference, Some(version)).await;
        let root = self.replay(reference, seed, Some(version)).await?;
        if root.version() < version {
            return Err(RepositoryError::VersionNotFound {
                reference,
                requested: version,
                latest: root.version(),
            });
        }
        Ok(root)
    }

    /// Commit the root's pending events.
    ///
    /// Returns `None` when there was nothing to save. After a successful
    /// commit the pending events are cleared and, if the new version lands on
    /// the kind's snapshot interval, a snapshot is written. A failed snapshot
    /// write is logged and never fails the save.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::ConcurrencyConflict`] if the aggregate moved on
    /// - [`RepositoryError::UnknownKind`] if the kind is not registered
    /// - [`RepositoryError::Storage`] on storage failure
    ///
    /// The root is left untouched on error.
    pub async fn save(
        &self,
        root: &mut AggregateRoot<A>,
    ) -> Result<Option<CommitAck>, RepositoryError> {
        if !root.has_pending() {
            return Ok(None);
        }
        if !self.app.registry().contains(A::KIND) {
            return Err(RepositoryError::UnknownKind(A::KIND.to_string()));
        }

        let batch = AppendBatch::new(root.reference(), root.committed_version(), root.pending().to_vec());
        let ack = self.app.commit(Commit::single(batch)).await.map_err(|err| {
            if let EventStoreError::ConcurrencyConflict { actual, .. } = &err {
                tracing::debug!(
                    application = self.app.name(),
                    kind = A::KIND,
                    reference = %root.reference(),
                    expected = %root.committed_version(),
                    actual = %actual,
                    "Save rejected by version check"
                );
            }
            RepositoryError::from(err)
        })?;

        root.clear_pending();
        tracing::debug!(
            application = self.app.name(),
            kind = A::KIND,
            reference = %root.reference(),
            version = %root.version(),
            position = %ack.last_position,
            "Aggregate saved"
        );

        self.snapshot_if_due(root).await;
        Ok(Some(ack))
    }

    /// Create an aggregate at `reference`, or return the one already there.
    ///
    /// `factory` produces the creation event and is only called if the
    /// aggregate does not exist yet. If another caller creates it first, the
    /// failed creation is discarded and the winner's aggregate is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] on storage failures, or if the factory's
    /// event is not a creation event.
    pub async fn create_or_get_at<F>(
        &self,
        reference: AggregateId,
        factory: F,
    ) -> Result<AggregateRoot<A>, RepositoryError>
    where
        F: FnOnce() -> A::Event,
    {
        match self.get(reference).await {
            Ok(existing) => return Ok(existing),
            Err(RepositoryError::AggregateNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut root = AggregateRoot::<A>::create(reference, factory(), self.app.clock().now())?;
        match self.save(&mut root).await {
            Ok(_) => Ok(root),
            Err(RepositoryError::ConcurrencyConflict { expected, .. }) if expected.is_initial() => {
                tracing::debug!(
                    application = self.app.name(),
                    kind = A::KIND,
                    reference = %reference,
                    "Aggregate created concurrently, returning the existing one"
                );
                self.get(reference).await
            }
            Err(e) => Err(e),
        }
    }

    /// Write a snapshot of the aggregate at its current version.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::SnapshotsDisabled`] if there is no snapshot store
    /// - otherwise as [`Repository::get`]
    pub async fn take_snapshot(&self, reference: AggregateId) -> Result<Version, RepositoryError> {
        let Some(snapshots) = self.app.snapshots() else {
            return Err(RepositoryError::SnapshotsDisabled(self.app.name().to_string()));
        };
        let root = self.get(reference).await?;
        let snapshot = root
            .to_snapshot(self.app.clock().now())
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        snapshots.save_snapshot(snapshot).await?;
        RepositoryMetrics::record_snapshot(A::KIND);
        tracing::info!(
            application = self.app.name(),
            kind = A::KIND,
            reference = %reference,
            version = %root.version(),
            "Snapshot taken"
        );
        Ok(root.version())
    }

    async fn load_seed(&self, reference: AggregateId, at: Option<Version>) -> Option<AggregateRoot<A>> {
        let snapshots = self.app.snapshots()?;
        let loaded = match at {
            Some(version) => snapshots.load_at_or_before(reference, version).await,
            None => snapshots.load_latest(reference).await,
        };
        match loaded {
            Ok(snapshot) => self.restore(snapshot.as_ref()?),
            Err(e) => {
                tracing::warn!(
                    application = self.app.name(),
                    kind = A::KIND,
                    reference = %reference,
                    error = %e,
                    "Snapshot load failed, replaying from the first event"
                );
                None
            }
        }
    }

    fn restore(&self, snapshot: &Snapshot) -> Option<AggregateRoot<A>> {
        match AggregateRoot::<A>::from_snapshot(snapshot) {
            Ok(root) => Some(root),
            Err(e) => {
                tracing::warn!(
                    application = self.app.name(),
                    kind = A::KIND,
                    reference = %snapshot.reference,
                    version = %snapshot.version,
                    error = %e,
                    "Ignoring unreadable snapshot, replaying from the first event"
                );
                None
            }
        }
    }

    async fn replay(
        &self,
        reference: AggregateId,
        seed: Option<AggregateRoot<A>>,
        up_to: Option<Version>,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        let after = seed.as_ref().map_or(Version::INITIAL, AggregateRoot::version);
        let limit = up_to.map(|v| usize::try_from(v.value().saturating_sub(after.value())).unwrap_or(usize::MAX));

        let events = if limit == Some(0) {
            Vec::new()
        } else {
            self.app.events().read_stream(reference, after, limit).await?
        };
        self.check_registered(&events)?;

        RepositoryMetrics::record_replay(A::KIND, events.len());
        replay::fold(reference, seed, &events)
            .map_err(|e| RepositoryError::from_replay(A::KIND, e))?
            .ok_or(RepositoryError::AggregateNotFound(reference))
    }

    fn check_registered(&self, events: &[StoredEvent]) -> Result<(), RepositoryError> {
        for event in events {
            self.app.registry().check(&event.kind, &event.event_type)?;
        }
        Ok(())
    }

    async fn snapshot_if_due(&self, root: &AggregateRoot<A>) {
        self.app
            .snapshot_if_due(A::KIND, root.reference(), root.version(), |now| root.to_snapshot(now))
            .await;
    }
}

impl<A: NaturalKey> Repository<A> {
    /// Create the aggregate identified by a natural key, or return it if it
    /// already exists.
    ///
    /// Concurrent callers with the same key all receive the same aggregate;
    /// exactly one creation event is ever committed.
    ///
    /// # Errors
    ///
    /// See [`Repository::create_or_get_at`].
    pub async fn create_or_get<F>(&self, key: &str, factory: F) -> Result<AggregateRoot<A>, RepositoryError>
    where
        F: FnOnce() -> A::Event,
    {
        self.create_or_get_at(A::reference_for(key), factory).await
    }

    /// Load the aggregate identified by a natural key.
    ///
    /// # Errors
    ///
    /// See [`Repository::get`].
    pub async fn get_by_key(&self, key: &str) -> Result<AggregateRoot<A>, RepositoryError> {
        self.get(A::reference_for(key)).await
    }
}
