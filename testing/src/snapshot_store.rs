//! In-memory snapshot store.

use rehydrate_core::event_store::{EventStoreError, StoreFuture};
use rehydrate_core::snapshot::{Snapshot, SnapshotStore};
use rehydrate_core::stream::{AggregateId, Version};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Shelves = HashMap<AggregateId, BTreeMap<Version, Snapshot>>;

/// Snapshot store held in memory, keeping every version.
///
/// Writes can be switched to fail, to check that a broken snapshot store
/// never breaks saving or loading aggregates.
#[derive(Clone, Debug, Default)]
pub struct InMemorySnapshotStore {
    shelves: Arc<Mutex<Shelves>>,
    failing: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with `Unavailable` (or stop failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail only the next `n` calls with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Versions snapshotted for an aggregate, ascending.
    #[must_use]
    pub fn versions(&self, reference: AggregateId) -> Vec<Version> {
        self.lock()
            .get(&reference)
            .map_or_else(Vec::new, |s| s.keys().copied().collect())
    }

    /// Total number of snapshots across all aggregates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    /// Whether no snapshot was ever saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace a stored snapshot's bytes, to exercise unreadable snapshots.
    pub fn corrupt(&self, reference: AggregateId, version: Version) {
        if let Some(snapshot) = self
            .lock()
            .get_mut(&reference)
            .and_then(|s| s.get_mut(&version))
        {
            snapshot.state = vec![0xFF; 3];
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shelves> {
        self.shelves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), EventStoreError> {
        let tripped = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped || self.failing.load(Ordering::SeqCst) {
            Err(EventStoreError::Unavailable("snapshot store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn newest(&self, reference: AggregateId, at_most: Version) -> Result<Option<Snapshot>, EventStoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .get(&reference)
            .and_then(|s| s.range(..=at_most).next_back())
            .map(|(_, snapshot)| snapshot.clone()))
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save_snapshot(&self, snapshot: Snapshot) -> StoreFuture<'_, ()> {
        let result = self.check_available().map(|()| {
            self.lock()
                .entry(snapshot.reference)
                .or_default()
                .insert(snapshot.version, snapshot);
        });
        Box::pin(std::future::ready(result))
    }

    fn load_latest(&self, reference: AggregateId) -> StoreFuture<'_, Option<Snapshot>> {
        Box::pin(std::future::ready(self.newest(reference, Version::new(u64::MAX))))
    }

    fn load_at_or_before(
        &self,
        reference: AggregateId,
        version: Version,
    ) -> StoreFuture<'_, Option<Snapshot>> {
        Box::pin(std::future::ready(self.newest(reference, version)))
    }

    fn delete_snapshots(&self, reference: AggregateId) -> StoreFuture<'_, ()> {
        let result = self.check_available().map(|()| {
            self.lock().remove(&reference);
        });
        Box::pin(std::future::ready(result))
    }
}
