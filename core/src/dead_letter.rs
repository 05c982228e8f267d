//! Dead-letter sink for poison notifications.
//!
//! When a follower's policy keeps failing on the same notification, the
//! follower records it here and stalls that upstream until an operator skips
//! or retries it. Nothing is ever dropped silently.

use crate::event::StoredEvent;
use crate::event_store::StoreFuture;
use crate::stream::{AggregateId, Position};
use crate::{DateTime, Utc};

/// A notification that a follower could not process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedNotification {
    /// Follower that gave up on the notification.
    pub follower: String,
    /// Upstream application the notification came from.
    pub upstream: String,
    /// Notification position in the upstream sequence.
    pub position: Position,
    /// Type tag of the failing event.
    pub event_type: String,
    /// Aggregate the failing event belongs to.
    pub reference: AggregateId,
    /// Last error message.
    pub error: String,
    /// Number of failed attempts.
    pub attempts: u32,
    /// When the follower gave up.
    pub failed_at: DateTime<Utc>,
}

impl FailedNotification {
    /// Describe a failed notification.
    #[must_use]
    pub fn new(
        follower: impl Into<String>,
        upstream: impl Into<String>,
        event: &StoredEvent,
        error: impl Into<String>,
        attempts: u32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            follower: follower.into(),
            upstream: upstream.into(),
            position: event.position,
            event_type: event.event_type.clone(),
            reference: event.reference,
            error: error.into(),
            attempts,
            failed_at,
        }
    }
}

/// Somewhere to park poison notifications for an operator.
pub trait DeadLetterSink: Send + Sync {
    /// Record a failed notification.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn record(&self, failed: FailedNotification) -> StoreFuture<'_, ()>;
}
