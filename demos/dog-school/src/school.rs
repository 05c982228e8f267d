//! The `DogSchool` application.

use crate::domain::{self, DEFAULT_MAX_TRICKS, Dog, DogError, DogEvent, DogView};
use rehydrate_core::aggregate::NaturalKey;
use rehydrate_core::event_store::EventStore;
use rehydrate_core::registry::{Registry, RegistryError};
use rehydrate_core::snapshot::SnapshotStore;
use rehydrate_core::stream::{AggregateId, Version};
use rehydrate_core::Clock;
use rehydrate_runtime::retry::{RetryPolicy, retry_with_predicate};
use rehydrate_runtime::{Application, RepositoryError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`DogSchool`] commands and queries.
#[derive(Error, Debug)]
pub enum SchoolError {
    /// No dog with that name has been registered.
    #[error("No dog named {0}")]
    DogNotFound(String),

    /// A domain rule refused the command.
    #[error(transparent)]
    Dog(#[from] DogError),

    /// Loading or saving failed.
    #[error(transparent)]
    Repository(RepositoryError),
}

impl SchoolError {
    /// Whether the command lost a race with another writer.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Repository(e) if e.is_conflict())
    }

    fn from_repository(name: &str, error: RepositoryError) -> Self {
        match error {
            RepositoryError::AggregateNotFound(_) => Self::DogNotFound(name.to_string()),
            other => Self::Repository(other),
        }
    }
}

/// Builder for [`DogSchool`].
pub struct DogSchoolBuilder {
    events: Arc<dyn EventStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    clock: Option<Arc<dyn Clock>>,
    snapshot_interval: Option<u64>,
    max_tricks: usize,
    conflict_retry: RetryPolicy,
}

impl DogSchoolBuilder {
    /// Store snapshots here.
    #[must_use]
    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Override the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Snapshot every `interval` versions instead of every 100.
    #[must_use]
    pub const fn snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Cap the number of tricks per dog.
    #[must_use]
    pub const fn max_tricks(mut self, max_tricks: usize) -> Self {
        self.max_tricks = max_tricks;
        self
    }

    /// How `add_trick` retries after losing a race.
    #[must_use]
    pub fn conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    /// Build the application.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the snapshot interval is invalid.
    pub fn build(self) -> Result<DogSchool, RegistryError> {
        let mut registry = Registry::builder().register::<Dog>();
        if let Some(interval) = self.snapshot_interval {
            registry = registry.snapshot_interval::<Dog>(interval);
        }

        let mut app = Application::builder(DogSchool::NAME, self.events).registry(registry.build()?);
        if let Some(snapshots) = self.snapshots {
            app = app.snapshots(snapshots);
        }
        if let Some(clock) = self.clock {
            app = app.clock(clock);
        }

        Ok(DogSchool {
            app: app.build(),
            max_tricks: self.max_tricks,
            conflict_retry: self.conflict_retry,
        })
    }
}

/// Registers dogs and teaches them tricks.
#[derive(Clone)]
pub struct DogSchool {
    app: Application,
    max_tricks: usize,
    conflict_retry: RetryPolicy,
}

impl DogSchool {
    /// Application name, also the upstream name followers see.
    pub const NAME: &'static str = "dog_school";

    /// Start building a school on an event store.
    #[must_use]
    pub fn builder(events: Arc<dyn EventStore>) -> DogSchoolBuilder {
        DogSchoolBuilder {
            events,
            snapshots: None,
            clock: None,
            snapshot_interval: None,
            max_tricks: DEFAULT_MAX_TRICKS,
            conflict_retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(200))
                .build(),
        }
    }

    /// The underlying application.
    #[must_use]
    pub const fn application(&self) -> &Application {
        &self.app
    }

    /// Register a dog. Registering the same name twice returns the same
    /// reference and writes nothing the second time.
    ///
    /// # Errors
    ///
    /// Returns [`SchoolError::Repository`] if storage fails.
    pub async fn register_dog(&self, name: &str) -> Result<AggregateId, SchoolError> {
        let dog = self
            .app
            .repository::<Dog>()
            .create_or_get(name, || DogEvent::Registered {
                name: name.to_string(),
            })
            .await
            .map_err(SchoolError::Repository)?;
        tracing::info!(dog = name, reference = %dog.reference(), "Dog registered");
        Ok(dog.reference())
    }

    /// Teach a registered dog a trick.
    ///
    /// Losing a race with another writer reloads the dog and tries again,
    /// bounded by the conflict retry policy.
    ///
    /// # Errors
    ///
    /// - [`SchoolError::DogNotFound`] if the dog is not registered
    /// - [`SchoolError::Dog`] if the dog knows too many tricks
    /// - [`SchoolError::Repository`] if storage fails, or conflicts persist
    pub async fn add_trick(&self, name: &str, trick: &str) -> Result<(), SchoolError> {
        retry_with_predicate(
            &self.conflict_retry,
            || self.try_add_trick(name, trick),
            SchoolError::is_conflict,
        )
        .await
    }

    async fn try_add_trick(&self, name: &str, trick: &str) -> Result<(), SchoolError> {
        let repository = self.app.repository::<Dog>();
        let mut dog = repository
            .get_by_key(name)
            .await
            .map_err(|e| SchoolError::from_repository(name, e))?;
        domain::add_trick(&mut dog, trick, self.max_tricks, self.app.clock().now())?;
        repository.save(&mut dog).await.map_err(SchoolError::Repository)?;
        tracing::debug!(dog = name, trick, version = %dog.version(), "Trick added");
        Ok(())
    }

    /// Current view of a dog.
    ///
    /// # Errors
    ///
    /// - [`SchoolError::DogNotFound`] if the dog is not registered
    /// - [`SchoolError::Repository`] if storage fails
    pub async fn get_dog(&self, name: &str) -> Result<DogView, SchoolError> {
        let dog = self
            .app
            .repository::<Dog>()
            .get_by_key(name)
            .await
            .map_err(|e| SchoolError::from_repository(name, e))?;
        Ok(DogView::from(dog.state()))
    }

    /// Snapshot a dog at its current version.
    ///
    /// # Errors
    ///
    /// - [`SchoolError::DogNotFound`] if the dog is not registered
    /// - [`SchoolError::Repository`] if snapshots are disabled or storage fails
    pub async fn snapshot(&self, name: &str) -> Result<Version, SchoolError> {
        self.app
            .take_snapshot::<Dog>(Dog::reference_for(name))
            .await
            .map_err(|e| SchoolError::from_repository(name, e))
    }
}
