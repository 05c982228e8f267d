//! Snapshot storage.
//!
//! A snapshot caches the replayed state of one aggregate at one version. It is
//! never authoritative: deleting every snapshot changes replay cost, not
//! observable state.

use crate::event_store::StoreFuture;
use crate::stream::{AggregateId, Version};
use crate::{DateTime, Utc};

/// A cached `(reference, version, state)` tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// The aggregate this snapshot belongs to.
    pub reference: AggregateId,
    /// Aggregate kind, checked on restore.
    pub kind: String,
    /// Version of the aggregate captured in `state`.
    pub version: Version,
    /// Schema version of the aggregate value, see `Aggregate::SCHEMA_VERSION`.
    pub schema_version: u32,
    /// Bincode-serialized aggregate root.
    pub state: Vec<u8>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Storage backend for snapshots.
///
/// # Strategy
///
/// - The repository saves a snapshot whenever a commit lands an aggregate on
///   a multiple of its kind's snapshot interval
/// - Loading state: latest snapshot, then replay events after its version
/// - Older snapshots may be retained or pruned; correctness never depends on it
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot. Saving the same `(reference, version)` twice overwrites.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn save_snapshot(&self, snapshot: Snapshot) -> StoreFuture<'_, ()>;

    /// Load the snapshot with the highest version for an aggregate.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn load_latest(&self, reference: AggregateId) -> StoreFuture<'_, Option<Snapshot>>;

    /// Load the newest snapshot at or below `version`.
    ///
    /// Used to rebuild historical state without folding from the beginning.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn load_at_or_before(
        &self,
        reference: AggregateId,
        version: Version,
    ) -> StoreFuture<'_, Option<Snapshot>>;

    /// Delete every snapshot of an aggregate.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: storage failure
    fn delete_snapshots(&self, reference: AggregateId) -> StoreFuture<'_, ()>;
}
