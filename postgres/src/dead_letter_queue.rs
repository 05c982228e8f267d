//! Dead Letter Queue (DLQ) for poison notifications.
//!
//! A follower parks a notification here once its policy has failed on it
//! `max_attempts` times, then stalls that upstream. The table keeps enough to
//! investigate the failure and to record what the operator did about it.

use crate::{from_db, map_sqlx_error, to_db};
use chrono::{DateTime, Utc};
use rehydrate_core::dead_letter::{DeadLetterSink, FailedNotification};
use rehydrate_core::event_store::{EventStoreError, StoreFuture};
use rehydrate_core::stream::{AggregateId, Position};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Status of a failed notification in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for an operator
    Pending,
    /// An operator is working on it
    Processing,
    /// The follower got past it (retried successfully or skipped on purpose)
    Resolved,
    /// Given up on for good
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, EventStoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(EventStoreError::DatabaseError(format!(
                "Invalid DLQ status: {s}"
            ))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedEntry {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// What failed, where, and how often
    pub notification: FailedNotification,

    /// When this notification was first parked
    pub first_failed_at: DateTime<Utc>,

    /// Current status
    pub status: DLQStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue, shared by every follower.
///
/// One row per `(follower, upstream, position)`. Parking the same
/// notification again (after an operator retry that failed again) updates the
/// row and puts it back to `pending`.
///
/// # Example
///
/// ```no_run
/// use rehydrate_postgres::{DLQStatus, DeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// dlq.update_status(pending[0].id, DLQStatus::Processing).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `failed_notifications` table if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS failed_notifications (
                id BIGSERIAL PRIMARY KEY,
                follower TEXT NOT NULL,
                upstream TEXT NOT NULL,
                position BIGINT NOT NULL,
                event_type TEXT NOT NULL,
                reference UUID NOT NULL,
                error_message TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                first_failed_at TIMESTAMPTZ NOT NULL,
                last_failed_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                resolved_at TIMESTAMPTZ,
                resolved_by TEXT,
                resolution_notes TEXT,
                UNIQUE (follower, upstream, position)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failed_notifications_status ON failed_notifications(status, first_failed_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    /// Park a failed notification.
    ///
    /// # Returns
    ///
    /// The unique ID of the DLQ entry.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the insert fails.
    pub async fn add_entry(&self, failed: &FailedNotification) -> Result<i64, EventStoreError> {
        let attempts = i32::try_from(failed.attempts).unwrap_or(i32::MAX);
        let id: (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_notifications (
                follower, upstream, position, event_type, reference,
                error_message, attempts, first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (follower, upstream, position) DO UPDATE SET
                error_message = EXCLUDED.error_message,
                attempts = failed_notifications.attempts + EXCLUDED.attempts,
                last_failed_at = EXCLUDED.last_failed_at,
                status = 'pending',
                resolved_at = NULL,
                resolved_by = NULL,
                resolution_notes = NULL
            RETURNING id
            ",
        )
        .bind(&failed.follower)
        .bind(&failed.upstream)
        .bind(to_db(failed.position.value()))
        .bind(&failed.event_type)
        .bind(failed.reference.into_inner())
        .bind(&failed.error)
        .bind(attempts)
        .bind(failed.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::warn!(
            dlq_id = id.0,
            follower = %failed.follower,
            upstream = %failed.upstream,
            position = %failed.position,
            event_type = %failed.event_type,
            error = %failed.error,
            attempts = failed.attempts,
            "Notification added to Dead Letter Queue"
        );

        metrics::counter!("dead_letter_queue_added_total", "follower" => failed.follower.clone())
            .increment(1);

        Ok(id.0)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedEntry>, EventStoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedEntry>, EventStoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, follower, upstream, position, event_type, reference,
                error_message, attempts, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_notifications
            WHERE status = $1
            ORDER BY first_failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(to_db(limit as u64))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// Entries parked by one follower for one upstream, in position order.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails.
    pub async fn list_for(
        &self,
        follower: &str,
        upstream: &str,
    ) -> Result<Vec<FailedEntry>, EventStoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, follower, upstream, position, event_type, reference,
                error_message, attempts, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_notifications
            WHERE follower = $1 AND upstream = $2
            ORDER BY position ASC
            ",
        )
        .bind(follower)
        .bind(upstream)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// Get a specific entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails or entry not found.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedEntry, EventStoreError> {
        let row = sqlx::query(
            r"
            SELECT
                id, follower, upstream, position, event_type, reference,
                error_message, attempts, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_notifications
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Self::row_to_entry(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), EventStoreError> {
        sqlx::query("UPDATE failed_notifications SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), EventStoreError> {
        sqlx::query(
            r"
            UPDATE failed_notifications
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("dead_letter_queue_resolved_total").increment(1);

        Ok(())
    }

    /// Mark an entry as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), EventStoreError> {
        sqlx::query(
            r"
            UPDATE failed_notifications
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");

        metrics::counter!("dead_letter_queue_discarded_total").increment(1);

        Ok(())
    }

    /// Count pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, EventStoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_notifications WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(count)
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<FailedEntry, EventStoreError> {
        let status: String = row.try_get("status").map_err(map_sqlx_error)?;
        let position: i64 = row.try_get("position").map_err(map_sqlx_error)?;
        let reference: Uuid = row.try_get("reference").map_err(map_sqlx_error)?;
        let attempts: i32 = row.try_get("attempts").map_err(map_sqlx_error)?;

        Ok(FailedEntry {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            notification: FailedNotification {
                follower: row.try_get("follower").map_err(map_sqlx_error)?,
                upstream: row.try_get("upstream").map_err(map_sqlx_error)?,
                position: Position::new(from_db(position)),
                event_type: row.try_get("event_type").map_err(map_sqlx_error)?,
                reference: AggregateId::new(reference),
                error: row.try_get("error_message").map_err(map_sqlx_error)?,
                attempts: u32::try_from(attempts).unwrap_or_default(),
                failed_at: row.try_get("last_failed_at").map_err(map_sqlx_error)?,
            },
            first_failed_at: row.try_get("first_failed_at").map_err(map_sqlx_error)?,
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(map_sqlx_error)?,
            resolved_by: row.try_get("resolved_by").map_err(map_sqlx_error)?,
            resolution_notes: row.try_get("resolution_notes").map_err(map_sqlx_error)?,
        })
    }

    async fn record_failure(&self, failed: FailedNotification) -> Result<(), EventStoreError> {
        self.add_entry(&failed).await.map(|_| ())
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn record(&self, failed: FailedNotification) -> StoreFuture<'_, ()> {
        Box::pin(self.record_failure(failed))
    }
}
