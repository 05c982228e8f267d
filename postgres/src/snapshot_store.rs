//! `PostgreSQL` implementation of [`SnapshotStore`].

use crate::{from_db, map_sqlx_error, schema_from_db, schema_to_db, table_prefix, to_db};
use rehydrate_core::event_store::{EventStoreError, StoreFuture};
use rehydrate_core::snapshot::{Snapshot, SnapshotStore};
use rehydrate_core::stream::{AggregateId, Version};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

/// Snapshot store for one application.
///
/// ```sql
/// CREATE TABLE {app}_snapshots (
///     reference UUID NOT NULL,
///     version BIGINT NOT NULL,
///     kind TEXT NOT NULL,
///     schema_version INTEGER NOT NULL DEFAULT 1,
///     state BYTEA NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     PRIMARY KEY (reference, version)
/// );
/// ```
#[derive(Clone)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
    table: String,
}

impl PostgresSnapshotStore {
    /// Create a store for `application` using an existing pool.
    #[must_use]
    pub fn new(pool: PgPool, application: &str) -> Self {
        Self {
            pool,
            table: format!("{}_snapshots", table_prefix(application)),
        }
    }

    /// Create the snapshot table if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the statement fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        let sql = format!(
            r"
            CREATE TABLE IF NOT EXISTS {} (
                reference UUID NOT NULL,
                version BIGINT NOT NULL,
                kind TEXT NOT NULL,
                schema_version INTEGER NOT NULL DEFAULT 1,
                state BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (reference, version)
            )
            ",
            self.table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let alter = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS schema_version INTEGER NOT NULL DEFAULT 1",
            self.table
        );
        sqlx::query(&alter)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let sql = format!(
            r"
            INSERT INTO {} (reference, version, kind, schema_version, state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (reference, version)
            DO UPDATE SET kind = EXCLUDED.kind, schema_version = EXCLUDED.schema_version,
                state = EXCLUDED.state, created_at = EXCLUDED.created_at
            ",
            self.table
        );
        sqlx::query(&sql)
            .bind(snapshot.reference.into_inner())
            .bind(to_db(snapshot.version.value()))
            .bind(&snapshot.kind)
            .bind(schema_to_db(snapshot.schema_version))
            .bind(&snapshot.state)
            .bind(snapshot.timestamp)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        tracing::debug!(
            reference = %snapshot.reference,
            version = %snapshot.version,
            bytes = snapshot.state.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    async fn load(
        &self,
        reference: AggregateId,
        at_most: Option<Version>,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let sql = format!(
            r"
            SELECT reference, version, kind, schema_version, state, created_at
            FROM {}
            WHERE reference = $1 AND ($2::BIGINT IS NULL OR version <= $2)
            ORDER BY version DESC
            LIMIT 1
            ",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(reference.into_inner())
            .bind(at_most.map(|v| to_db(v.value())))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(row_to_snapshot).transpose()
    }

    async fn delete(&self, reference: AggregateId) -> Result<(), EventStoreError> {
        let sql = format!("DELETE FROM {} WHERE reference = $1", self.table);
        let result = sqlx::query(&sql)
            .bind(reference.into_inner())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        tracing::debug!(%reference, deleted = result.rows_affected(), "Snapshots deleted");
        Ok(())
    }
}

fn row_to_snapshot(row: &PgRow) -> Result<Snapshot, EventStoreError> {
    let reference: Uuid = row.try_get("reference").map_err(map_sqlx_error)?;
    let version: i64 = row.try_get("version").map_err(map_sqlx_error)?;
    let schema_version: i32 = row.try_get("schema_version").map_err(map_sqlx_error)?;
    Ok(Snapshot {
        reference: AggregateId::new(reference),
        kind: row.try_get("kind").map_err(map_sqlx_error)?,
        version: Version::new(from_db(version)),
        schema_version: schema_from_db(schema_version),
        state: row.try_get("state").map_err(map_sqlx_error)?,
        timestamp: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

impl SnapshotStore for PostgresSnapshotStore {
    fn save_snapshot(&self, snapshot: Snapshot) -> StoreFuture<'_, ()> {
        Box::pin(self.save(snapshot))
    }

    fn load_latest(&self, reference: AggregateId) -> StoreFuture<'_, Option<Snapshot>> {
        Box::pin(self.load(reference, None))
    }

    fn load_at_or_before(
        &self,
        reference: AggregateId,
        version: Version,
    ) -> StoreFuture<'_, Option<Snapshot>> {
        Box::pin(self.load(reference, Some(version)))
    }

    fn delete_snapshots(&self, reference: AggregateId) -> StoreFuture<'_, ()> {
        Box::pin(self.delete(reference))
    }
}
