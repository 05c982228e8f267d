//! In-memory dead-letter queue.

use rehydrate_core::dead_letter::{DeadLetterSink, FailedNotification};
use rehydrate_core::event_store::StoreFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Collects poison notifications for assertions.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    entries: Arc<Mutex<Vec<FailedNotification>>>,
}

impl InMemoryDeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded notifications, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<FailedNotification> {
        self.lock().clone()
    }

    /// Number of recorded notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FailedNotification>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn record(&self, failed: FailedNotification) -> StoreFuture<'_, ()> {
        self.lock().push(failed);
        Box::pin(std::future::ready(Ok(())))
    }
}
