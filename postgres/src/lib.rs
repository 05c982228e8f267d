//! `PostgreSQL` persistence for rehydrate applications.
//!
//! This crate provides the production implementations of the storage traits
//! from `rehydrate-core`:
//!
//! - [`PostgresEventStore`]: per-application events and tracking tables,
//!   atomic commits with optimistic concurrency
//! - [`PostgresSnapshotStore`]: per-application snapshot table
//! - [`DeadLetterQueue`]: poison notifications parked for an operator
//!
//! Every application gets its own tables, prefixed by its name, so several
//! applications of one system can share a database:
//!
//! ```text
//! dog_school_events      dog_school_tracking      dog_school_snapshots
//! counters_events        counters_tracking        counters_snapshots
//! failed_notifications   (shared by every follower)
//! ```
//!
//! Table names are dynamic, so the schema is created at runtime by
//! [`migrate`] instead of `sqlx::migrate!`.
//!
//! # Example
//!
//! ```no_run
//! use rehydrate_postgres::{PostgresEventStore, connect, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/rehydrate").await?;
//! migrate(&pool, "dog_school").await?;
//! let events = PostgresEventStore::new(pool, "dog_school");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod event_store;
mod snapshot_store;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedEntry};
pub use event_store::PostgresEventStore;
pub use snapshot_store::PostgresSnapshotStore;
pub use sqlx::PgPool;

use rehydrate_core::event_store::EventStoreError;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`EventStoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str) -> Result<PgPool, EventStoreError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| EventStoreError::Unavailable(format!("Failed to connect: {e}")))
}

/// Create every table one application needs, plus the shared dead-letter table.
///
/// Idempotent: all statements use `IF NOT EXISTS`. Tables created before
/// schema versions were recorded gain a `schema_version` column defaulting
/// to 1.
///
/// # Errors
///
/// Returns [`EventStoreError::DatabaseError`] if a statement fails.
pub async fn migrate(pool: &PgPool, application: &str) -> Result<(), EventStoreError> {
    PostgresEventStore::new(pool.clone(), application).migrate().await?;
    PostgresSnapshotStore::new(pool.clone(), application).migrate().await?;
    DeadLetterQueue::new(pool.clone()).migrate().await?;
    tracing::info!(application, "Schema migrated");
    Ok(())
}

/// Turn an application name into a safe table prefix.
///
/// Lowercases and replaces anything outside `[a-z0-9_]` with `_`; a leading
/// digit gets an `app_` prefix.
pub(crate) fn table_prefix(application: &str) -> String {
    let mut prefix: String = application
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if prefix.is_empty() || prefix.starts_with(|c: char| c.is_ascii_digit()) {
        prefix.insert_str(0, "app_");
    }
    prefix
}

/// Map a driver error onto the store error taxonomy.
///
/// Transport failures are transient; everything else is not.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> EventStoreError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => EventStoreError::Unavailable(error.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::SerializationError(error.to_string())
        }
        _ => EventStoreError::DatabaseError(error.to_string()),
    }
}

/// Convert a counter into a `BIGINT` value.
#[allow(clippy::cast_possible_wrap)] // Versions and positions never reach i64::MAX
pub(crate) const fn to_db(value: u64) -> i64 {
    value as i64
}

/// Convert a `BIGINT` value back into a counter.
#[allow(clippy::cast_sign_loss)] // Columns only ever hold non-negative values
pub(crate) const fn from_db(value: i64) -> u64 {
    value as u64
}

/// Convert a schema version into an `INTEGER` value.
#[allow(clippy::cast_possible_wrap)] // Schema versions stay small
pub(crate) const fn schema_to_db(value: u32) -> i32 {
    value as i32
}

/// Convert an `INTEGER` value back into a schema version.
///
/// Negative values map to 0, which every reader rejects.
pub(crate) fn schema_from_db(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}
