//! Applications: one event store, its registry and its collaborators.
//!
//! An [`Application`] is the unit a follower tracks: it owns one notification
//! sequence. Cloning is cheap, every part is behind an `Arc`.

use crate::metrics::{EventStoreMetrics, RepositoryMetrics};
use crate::repository::{Repository, RepositoryError};
use rehydrate_core::aggregate::Aggregate;
use rehydrate_core::environment::{Clock, SystemClock};
use rehydrate_core::event::EventError;
use rehydrate_core::event_store::{Commit, CommitAck, EventStore, EventStoreError};
use rehydrate_core::registry::Registry;
use rehydrate_core::snapshot::{Snapshot, SnapshotStore};
use rehydrate_core::stream::{AggregateId, Position, Version};
use rehydrate_core::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// A named event-sourced application.
#[derive(Clone)]
pub struct Application {
    name: Arc<str>,
    events: Arc<dyn EventStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    committed: Arc<watch::Sender<Position>>,
}

impl Application {
    /// Start building an application around its event store.
    #[must_use]
    pub fn builder(name: impl Into<String>, events: Arc<dyn EventStore>) -> ApplicationBuilder {
        ApplicationBuilder {
            name: name.into(),
            events,
            snapshots: None,
            registry: Registry::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Application name, used as the upstream name in tracking records.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event store.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    /// The snapshot store, if snapshots are enabled.
    #[must_use]
    pub fn snapshots(&self) -> Option<&Arc<dyn SnapshotStore>> {
        self.snapshots.as_ref()
    }

    /// The registry of aggregate kinds.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The injected clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// A repository for one aggregate kind.
    #[must_use]
    pub fn repository<A: Aggregate>(&self) -> Repository<A> {
        Repository::new(self.clone())
    }

    /// Receiver of the highest committed position, for push wake-ups.
    ///
    /// Only commits made through [`Application::commit`] are announced; a
    /// follower polls as well, so writes by other processes are still seen.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Position> {
        self.committed.subscribe()
    }

    /// Commit through the event store, then wake followers.
    ///
    /// # Errors
    ///
    /// Returns the event store's error unchanged.
    pub async fn commit(&self, commit: Commit) -> Result<CommitAck, EventStoreError> {
        let events = commit.event_count();
        let started = Instant::now();

        match self.events.commit(commit).await {
            Ok(ack) => {
                EventStoreMetrics::record_commit(events, started.elapsed());
                if events > 0 {
                    self.announce(ack.last_position);
                }
                Ok(ack)
            }
            Err(err) => {
                if matches!(err, EventStoreError::ConcurrencyConflict { .. }) {
                    EventStoreMetrics::record_conflict();
                }
                Err(err)
            }
        }
    }

    /// Take a snapshot of an aggregate at its current version.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the aggregate cannot be loaded, snapshots
    /// are disabled, or the snapshot cannot be written.
    pub async fn take_snapshot<A: Aggregate>(
        &self,
        reference: AggregateId,
    ) -> Result<Version, RepositoryError> {
        self.repository::<A>().take_snapshot(reference).await
    }

    /// Write a snapshot if `version` lands on the snapshot interval of `kind`.
    ///
    /// Used after every successful commit, by repositories and followers
    /// alike. Returns whether a snapshot was written; a failed write is
    /// logged and counted, never returned.
    pub(crate) async fn snapshot_if_due<F>(
        &self,
        kind: &'static str,
        reference: AggregateId,
        version: Version,
        snapshot: F,
    ) -> bool
    where
        F: FnOnce(DateTime<Utc>) -> Result<Snapshot, EventError>,
    {
        let Some(snapshots) = self.snapshots() else {
            return false;
        };
        let Some(interval) = self.registry.snapshot_interval(kind) else {
            return false;
        };
        if !version.is_multiple_of(interval) {
            return false;
        }

        let result = match snapshot(self.clock.now()) {
            Ok(snapshot) => snapshots.save_snapshot(snapshot).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => {
                RepositoryMetrics::record_snapshot(kind);
                tracing::debug!(
                    application = %self.name,
                    kind,
                    reference = %reference,
                    version = %version,
                    "Snapshot taken"
                );
                true
            }
            Err(error) => {
                RepositoryMetrics::record_snapshot_failure(kind);
                tracing::warn!(
                    application = %self.name,
                    kind,
                    reference = %reference,
                    version = %version,
                    error = %error,
                    "Snapshot write failed"
                );
                false
            }
        }
    }

    fn announce(&self, position: Position) {
        self.committed.send_if_modified(|current| {
            if position > *current {
                *current = position;
                true
            } else {
                false
            }
        });
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("snapshots", &self.snapshots.is_some())
            .field("kinds", &self.registry.kinds().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Application`].
pub struct ApplicationBuilder {
    name: String,
    events: Arc<dyn EventStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    registry: Registry,
    clock: Arc<dyn Clock>,
}

impl ApplicationBuilder {
    /// Enable snapshots.
    #[must_use]
    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Set the registry of aggregate kinds.
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Inject a clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the application.
    #[must_use]
    pub fn build(self) -> Application {
        let (committed, _) = watch::channel(Position::START);
        tracing::debug!(
            application = %self.name,
            kinds = ?self.registry.kinds().collect::<Vec<_>>(),
            snapshots = self.snapshots.is_some(),
            "Application built"
        );
        Application {
            name: self.name.into(),
            events: self.events,
            snapshots: self.snapshots,
            registry: Arc::new(self.registry),
            clock: self.clock,
            committed: Arc::new(committed),
        }
    }
}
