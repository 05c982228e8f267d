//! `PostgreSQL` implementation of [`EventStore`].

use crate::{from_db, map_sqlx_error, schema_from_db, schema_to_db, table_prefix, to_db};
use rehydrate_core::event::StoredEvent;
use rehydrate_core::event_store::{
    Commit, CommitAck, EventStore, EventStoreError, NotificationBatch, StoreFuture,
};
use rehydrate_core::stream::{AggregateId, Position, Version};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

/// SQL text for one application's tables, built once.
#[derive(Debug, Clone)]
struct Statements {
    create_events: String,
    add_schema_version: String,
    create_tracking: String,
    lock: String,
    stream_version: String,
    tracking_position: String,
    insert_event: String,
    upsert_tracking: String,
    read_stream: String,
    read_notifications: String,
    max_position: String,
}

impl Statements {
    fn new(prefix: &str) -> Self {
        let events = format!("{prefix}_events");
        let tracking = format!("{prefix}_tracking");
        Self {
            create_events: format!(
                r"
                CREATE TABLE IF NOT EXISTS {events} (
                    position BIGSERIAL UNIQUE,
                    reference UUID NOT NULL,
                    version BIGINT NOT NULL,
                    kind TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    schema_version INTEGER NOT NULL DEFAULT 1,
                    data BYTEA NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (reference, version)
                )
                "
            ),
            add_schema_version: format!(
                "ALTER TABLE {events} ADD COLUMN IF NOT EXISTS schema_version INTEGER NOT NULL DEFAULT 1"
            ),
            create_tracking: format!(
                r"
                CREATE TABLE IF NOT EXISTS {tracking} (
                    follower TEXT NOT NULL,
                    upstream TEXT NOT NULL,
                    position BIGINT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    PRIMARY KEY (follower, upstream)
                )
                "
            ),
            lock: format!("LOCK TABLE {events} IN EXCLUSIVE MODE"),
            stream_version: format!("SELECT MAX(version) FROM {events} WHERE reference = $1"),
            tracking_position: format!(
                "SELECT position FROM {tracking} WHERE follower = $1 AND upstream = $2"
            ),
            insert_event: format!(
                r"
                INSERT INTO {events} (reference, version, kind, event_type, schema_version, data, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING position
                "
            ),
            upsert_tracking: format!(
                r"
                INSERT INTO {tracking} (follower, upstream, position, updated_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (follower, upstream)
                DO UPDATE SET position = EXCLUDED.position, updated_at = EXCLUDED.updated_at
                "
            ),
            read_stream: format!(
                r"
                SELECT reference, version, kind, event_type, schema_version, data, created_at, position
                FROM {events}
                WHERE reference = $1 AND version > $2
                ORDER BY version ASC
                LIMIT $3
                "
            ),
            read_notifications: format!(
                r"
                SELECT reference, version, kind, event_type, schema_version, data, created_at, position
                FROM {events}
                WHERE position > $1
                ORDER BY position ASC
                LIMIT $2
                "
            ),
            max_position: format!("SELECT COALESCE(MAX(position), 0) FROM {events}"),
        }
    }
}

/// Event store for one application, backed by `PostgreSQL`.
///
/// Uses two tables named after the application:
///
/// ```sql
/// CREATE TABLE {app}_events (
///     position BIGSERIAL UNIQUE,
///     reference UUID NOT NULL,
///     version BIGINT NOT NULL,
///     kind TEXT NOT NULL,
///     event_type TEXT NOT NULL,
///     schema_version INTEGER NOT NULL DEFAULT 1,
///     data BYTEA NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     PRIMARY KEY (reference, version)
/// );
///
/// CREATE TABLE {app}_tracking (
///     follower TEXT NOT NULL,
///     upstream TEXT NOT NULL,
///     position BIGINT NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL,
///     PRIMARY KEY (follower, upstream)
/// );
/// ```
///
/// # Commit ordering
///
/// Every commit runs in one transaction holding `LOCK TABLE {app}_events IN
/// EXCLUSIVE MODE`. Writers are serialized, so positions are assigned and
/// become visible in commit order and a reader never sees position `n + 1`
/// before `n`. Readers are not blocked. A rolled-back commit leaves a hole in
/// the sequence; followers only rely on positions increasing.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    application: String,
    sql: Statements,
}

impl PostgresEventStore {
    /// Create a store for `application` using an existing pool.
    ///
    /// The application name becomes the table prefix; characters outside
    /// `[a-z0-9_]` are replaced.
    #[must_use]
    pub fn new(pool: PgPool, application: &str) -> Self {
        Self {
            pool,
            application: application.to_string(),
            sql: Statements::new(&table_prefix(application)),
        }
    }

    /// The connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the events and tracking tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::query(&self.sql.create_events)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query(&self.sql.add_schema_version)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query(&self.sql.create_tracking)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn commit_in_transaction(&self, commit: Commit) -> Result<CommitAck, EventStoreError> {
        commit.validate()?;

        // Dropping the transaction on any early return rolls it back.
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query(&self.sql.lock)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if let Some(tracking) = &commit.tracking {
            let stored = sqlx::query_scalar::<_, i64>(&self.sql.tracking_position)
                .bind(&tracking.follower)
                .bind(&tracking.upstream)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .map_or(Position::START, |p| Position::new(from_db(p)));
            if tracking.position <= stored {
                return Err(EventStoreError::TrackingConflict {
                    follower: tracking.follower.clone(),
                    upstream: tracking.upstream.clone(),
                    stored,
                    attempted: tracking.position,
                });
            }
        }

        for batch in &commit.batches {
            let actual = sqlx::query_scalar::<_, Option<i64>>(&self.sql.stream_version)
                .bind(batch.reference.into_inner())
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .map_or(Version::INITIAL, |v| Version::new(from_db(v)));
            if actual != batch.expected_version {
                return Err(EventStoreError::ConcurrencyConflict {
                    reference: batch.reference,
                    expected: batch.expected_version,
                    actual,
                });
            }
        }

        let event_count = commit.event_count();
        let mut last_position = None;
        let mut versions = Vec::with_capacity(commit.batches.len());
        for batch in commit.batches {
            let reference = batch.reference;
            let expected = batch.expected_version;
            let resulting = batch.resulting_version();
            for event in batch.events {
                let version = event.version;
                let position = sqlx::query_scalar::<_, i64>(&self.sql.insert_event)
                    .bind(reference.into_inner())
                    .bind(to_db(version.value()))
                    .bind(event.kind)
                    .bind(event.event_type)
                    .bind(schema_to_db(event.schema_version))
                    .bind(event.data)
                    .bind(event.timestamp)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| conflict_or_error(e, reference, expected, version))?;
                last_position = Some(Position::new(from_db(position)));
            }
            versions.push((reference, resulting));
        }

        let last_position = match last_position {
            Some(position) => position,
            None => sqlx::query_scalar::<_, i64>(&self.sql.max_position)
                .fetch_one(&mut *tx)
                .await
                .map(|p| Position::new(from_db(p)))
                .map_err(map_sqlx_error)?,
        };

        if let Some(tracking) = commit.tracking {
            sqlx::query(&self.sql.upsert_tracking)
                .bind(&tracking.follower)
                .bind(&tracking.upstream)
                .bind(to_db(tracking.position.value()))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        tracing::debug!(
            application = %self.application,
            events = event_count,
            last_position = %last_position,
            "Commit persisted"
        );

        Ok(CommitAck {
            last_position,
            versions,
        })
    }
}

/// A unique violation (SQLSTATE 23505) on `(reference, version)` means another
/// writer got there first.
fn conflict_or_error(
    error: sqlx::Error,
    reference: AggregateId,
    expected: Version,
    version: Version,
) -> EventStoreError {
    if let sqlx::Error::Database(db) = &error {
        if db.code().as_deref() == Some("23505") {
            return EventStoreError::ConcurrencyConflict {
                reference,
                expected,
                actual: version,
            };
        }
    }
    map_sqlx_error(error)
}

fn row_to_event(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let reference: Uuid = row.try_get("reference").map_err(map_sqlx_error)?;
    let version: i64 = row.try_get("version").map_err(map_sqlx_error)?;
    let position: i64 = row.try_get("position").map_err(map_sqlx_error)?;
    let schema_version: i32 = row.try_get("schema_version").map_err(map_sqlx_error)?;
    Ok(StoredEvent {
        reference: AggregateId::new(reference),
        kind: row.try_get("kind").map_err(map_sqlx_error)?,
        version: Version::new(from_db(version)),
        event_type: row.try_get("event_type").map_err(map_sqlx_error)?,
        schema_version: schema_from_db(schema_version),
        data: row.try_get("data").map_err(map_sqlx_error)?,
        timestamp: row.try_get("created_at").map_err(map_sqlx_error)?,
        position: Position::new(from_db(position)),
    })
}

impl EventStore for PostgresEventStore {
    fn commit(&self, commit: Commit) -> StoreFuture<'_, CommitAck> {
        Box::pin(self.commit_in_transaction(commit))
    }

    fn read_stream(
        &self,
        reference: AggregateId,
        after: Version,
        limit: Option<usize>,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(self.fetch_stream(reference, after, limit))
    }

    fn read_notifications(&self, after: Position, limit: usize) -> StoreFuture<'_, NotificationBatch> {
        Box::pin(self.fetch_notifications(after, limit))
    }

    fn max_position(&self) -> StoreFuture<'_, Position> {
        Box::pin(self.fetch_max_position())
    }

    fn tracking_position(&self, follower: &str, upstream: &str) -> StoreFuture<'_, Position> {
        let follower = follower.to_string();
        let upstream = upstream.to_string();
        Box::pin(async move { self.fetch_tracking(&follower, &upstream).await })
    }
}

impl PostgresEventStore {
    async fn fetch_stream(
        &self,
        reference: AggregateId,
        after: Version,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        // LIMIT NULL means no limit.
        let limit = limit.map(|l| to_db(l as u64));
        let rows = sqlx::query(&self.sql.read_stream)
            .bind(reference.into_inner())
            .bind(to_db(after.value()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn fetch_notifications(
        &self,
        after: Position,
        limit: usize,
    ) -> Result<NotificationBatch, EventStoreError> {
        let rows = sqlx::query(&self.sql.read_notifications)
            .bind(to_db(after.value()))
            .bind(to_db(limit as u64))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let events = rows
            .iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NotificationBatch::new(after, events))
    }

    async fn fetch_max_position(&self) -> Result<Position, EventStoreError> {
        let position = sqlx::query_scalar::<_, i64>(&self.sql.max_position)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Position::new(from_db(position)))
    }

    async fn fetch_tracking(&self, follower: &str, upstream: &str) -> Result<Position, EventStoreError> {
        let position = sqlx::query_scalar::<_, i64>(&self.sql.tracking_position)
            .bind(follower)
            .bind(upstream)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(position.map_or(Position::START, |p| Position::new(from_db(p))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_use_the_application_prefix() {
        let sql = Statements::new("dog_school");
        assert!(sql.create_events.contains("dog_school_events"));
        assert!(sql.create_tracking.contains("dog_school_tracking"));
        assert_eq!(sql.lock, "LOCK TABLE dog_school_events IN EXCLUSIVE MODE");
        assert!(sql.read_notifications.contains("ORDER BY position ASC"));
    }
}
