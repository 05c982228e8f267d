//! Where the demo keeps its events.
//!
//! `REHYDRATE_PERSISTENCE` selects the backend:
//!
//! - `memory` (default): one in-memory store per application, lost on exit
//! - `postgres`: tables in the database at `DATABASE_URL`; needs the
//!   `postgres` feature
//!
//! Either way the stores are wrapped in the retry decorators, so a dropped
//! connection is retried before a command or follower sees it.

use rehydrate_core::dead_letter::DeadLetterSink;
use rehydrate_core::event_store::{EventStore, EventStoreError};
use rehydrate_core::snapshot::SnapshotStore;
use rehydrate_runtime::{RetryPolicy, RetryingEventStore, RetryingSnapshotStore};
use rehydrate_testing::{InMemoryDeadLetterQueue, InMemoryEventStore, InMemorySnapshotStore};
use std::sync::Arc;
use thiserror::Error;

/// Environment variable naming the backend.
pub const PERSISTENCE_VAR: &str = "REHYDRATE_PERSISTENCE";

/// Environment variable holding the database URL.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// Errors choosing or opening a backend.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The backend name is not `memory` or `postgres`.
    #[error("Unknown persistence module {0:?}, expected \"memory\" or \"postgres\"")]
    UnknownModule(String),

    /// `postgres` was requested from a build without the feature.
    #[error("This binary was built without the postgres feature")]
    PostgresDisabled,

    /// `postgres` was requested but `DATABASE_URL` is unset.
    #[error("{DATABASE_URL_VAR} must be set for postgres persistence")]
    MissingDatabaseUrl,

    /// Connecting or migrating failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Stores for one application.
#[derive(Clone)]
pub struct Stores {
    /// Event and tracking store.
    pub events: Arc<dyn EventStore>,
    /// Snapshot store.
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl Stores {
    /// Wrap both stores so transient failures are retried under `policy`.
    #[must_use]
    pub fn retrying<E, S>(events: Arc<E>, snapshots: Arc<S>, policy: &RetryPolicy) -> Self
    where
        E: EventStore + 'static,
        S: SnapshotStore + 'static,
    {
        Self {
            events: Arc::new(RetryingEventStore::new(events, policy.clone())),
            snapshots: Arc::new(RetryingSnapshotStore::new(snapshots, policy.clone())),
        }
    }
}

/// A storage backend.
#[derive(Clone)]
pub enum Persistence {
    /// In-process stores.
    Memory {
        /// Shared by every follower.
        dead_letters: Arc<InMemoryDeadLetterQueue>,
    },
    /// `PostgreSQL` tables, one set per application.
    #[cfg(feature = "postgres")]
    Postgres(rehydrate_postgres::PgPool),
}

impl Persistence {
    /// In-memory backend.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory {
            dead_letters: Arc::new(InMemoryDeadLetterQueue::new()),
        }
    }

    /// Pick the backend from the environment.
    ///
    /// # Errors
    ///
    /// See [`PersistenceError`].
    pub async fn from_env() -> Result<Self, PersistenceError> {
        let module = std::env::var(PERSISTENCE_VAR).unwrap_or_else(|_| "memory".to_string());
        match module.to_ascii_lowercase().as_str() {
            "memory" | "" => Ok(Self::memory()),
            "postgres" => Self::postgres_from_env().await,
            _ => Err(PersistenceError::UnknownModule(module)),
        }
    }

    #[cfg(feature = "postgres")]
    async fn postgres_from_env() -> Result<Self, PersistenceError> {
        let url = std::env::var(DATABASE_URL_VAR).map_err(|_| PersistenceError::MissingDatabaseUrl)?;
        let pool = rehydrate_postgres::connect(&url).await?;
        tracing::info!(host = url.rsplit('@').next().unwrap_or("unknown"), "Using PostgreSQL persistence");
        Ok(Self::Postgres(pool))
    }

    #[cfg(not(feature = "postgres"))]
    #[allow(clippy::unused_async)]
    async fn postgres_from_env() -> Result<Self, PersistenceError> {
        Err(PersistenceError::PostgresDisabled)
    }

    /// Open the stores of one application, creating tables if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if migration fails.
    #[allow(clippy::unused_async)]
    pub async fn stores(&self, application: &str) -> Result<Stores, PersistenceError> {
        match self {
            Self::Memory { .. } => {
                tracing::debug!(application, "Using in-memory stores");
                Ok(Stores::retrying(
                    Arc::new(InMemoryEventStore::new()),
                    Arc::new(InMemorySnapshotStore::new()),
                    &RetryPolicy::default(),
                ))
            }
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => {
                rehydrate_postgres::migrate(pool, application).await?;
                Ok(Stores::retrying(
                    Arc::new(rehydrate_postgres::PostgresEventStore::new(pool.clone(), application)),
                    Arc::new(rehydrate_postgres::PostgresSnapshotStore::new(pool.clone(), application)),
                    &RetryPolicy::default(),
                ))
            }
        }
    }

    /// Where followers park poison notifications.
    #[must_use]
    pub fn dead_letters(&self) -> Arc<dyn DeadLetterSink> {
        match self {
            Self::Memory { dead_letters } => dead_letters.clone(),
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => Arc::new(rehydrate_postgres::DeadLetterQueue::new(pool.clone())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rehydrate_core::stream::{AggregateId, Position};
    use rehydrate_testing::FlakyEventStore;
    use std::time::Duration;

    #[tokio::test]
    async fn retrying_stores_ride_out_dropped_connections() {
        let flaky = Arc::new(FlakyEventStore::new(Arc::new(InMemoryEventStore::new())));
        let snapshots = InMemorySnapshotStore::new();
        let policy = RetryPolicy::builder()
            .max_retries(3)
            .initial_delay(Duration::from_millis(1))
            .build();
        let stores = Stores::retrying(Arc::clone(&flaky), Arc::new(snapshots.clone()), &policy);

        flaky.fail_next(2);
        assert_eq!(stores.events.max_position().await.unwrap(), Position::START);
        assert_eq!(flaky.failures_injected(), 2);

        snapshots.fail_next(3);
        assert!(stores.snapshots.load_latest(AggregateId::random()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_stores_are_separate_per_application() {
        let persistence = Persistence::memory();
        let a = persistence.stores("a").await.unwrap();
        let b = persistence.stores("b").await.unwrap();
        assert!(!Arc::ptr_eq(&a.events, &b.events));
    }
}
