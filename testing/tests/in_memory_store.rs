//! Contract tests for the in-memory stores.

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use proptest::prelude::*;
use rehydrate_core::dead_letter::{DeadLetterSink, FailedNotification};
use rehydrate_core::event::NewEvent;
use rehydrate_core::event_store::{AppendBatch, Commit, EventStore, EventStoreError, Tracking};
use rehydrate_core::snapshot::{Snapshot, SnapshotStore};
use rehydrate_core::stream::{AggregateId, Position, Version};
use rehydrate_testing::{FlakyEventStore, InMemoryDeadLetterQueue, InMemoryEventStore, InMemorySnapshotStore};
use std::sync::Arc;

fn events(from: u64, count: u64) -> Vec<NewEvent> {
    (from..from + count)
        .map(|v| NewEvent {
            kind: "dog".to_string(),
            event_type: "Dog.TrickAdded".to_string(),
            version: Version::new(v),
            schema_version: 1,
            data: vec![u8::try_from(v % 256).unwrap()],
            timestamp: Utc::now(),
        })
        .collect()
}

fn snapshot(reference: AggregateId, version: u64) -> Snapshot {
    Snapshot {
        reference,
        kind: "dog".to_string(),
        version: Version::new(version),
        schema_version: 1,
        state: vec![1, 2, 3],
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn append_assigns_versions_and_positions() {
    let store = InMemoryEventStore::new();
    let fido = AggregateId::from_natural_key("dogs", "Fido");

    let ack = store.append(fido, Version::INITIAL, events(1, 2)).await.unwrap();
    assert_eq!(ack.last_position, Position::new(2));
    assert_eq!(ack.version_of(fido), Some(Version::new(2)));

    let stream = store.read_stream(fido, Version::INITIAL, None).await.unwrap();
    let versions: Vec<u64> = stream.iter().map(|e| e.version.value()).collect();
    assert_eq!(versions, vec![1, 2]);
    assert!(stream.iter().all(|e| e.reference == fido));
}

#[tokio::test]
async fn stale_expected_version_is_a_conflict_and_writes_nothing() {
    let store = InMemoryEventStore::new();
    let fido = AggregateId::from_natural_key("dogs", "Fido");
    store.append(fido, Version::INITIAL, events(1, 1)).await.unwrap();

    let result = store.append(fido, Version::INITIAL, events(1, 1)).await;
    assert_eq!(
        result,
        Err(EventStoreError::ConcurrencyConflict {
            reference: fido,
            expected: Version::INITIAL,
            actual: Version::new(1),
        })
    );
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn concurrent_appends_at_same_version_one_wins() {
    let store = Arc::new(InMemoryEventStore::new());
    let fido = AggregateId::from_natural_key("dogs", "Fido");
    store.append(fido, Version::INITIAL, events(1, 1)).await.unwrap();

    let a = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.append(fido, Version::new(1), events(2, 1)).await })
    };
    let b = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.append(fido, Version::new(1), events(2, 1)).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(EventStoreError::ConcurrencyConflict { .. }))));
    assert_eq!(store.stream(fido).len(), 2);
}

#[tokio::test]
async fn failed_commit_is_all_or_nothing() {
    let store = InMemoryEventStore::new();
    let fido = AggregateId::from_natural_key("dogs", "Fido");
    let rex = AggregateId::from_natural_key("dogs", "Rex");
    store.append(rex, Version::INITIAL, events(1, 1)).await.unwrap();

    let commit = Commit {
        batches: vec![
            AppendBatch::new(fido, Version::INITIAL, events(1, 1)),
            AppendBatch::new(rex, Version::INITIAL, events(1, 1)),
        ],
        tracking: Some(Tracking::new("counters", "dog_school", Position::new(5))),
    };
    assert!(store.commit(commit).await.is_err());

    assert!(store.stream(fido).is_empty());
    assert_eq!(
        store.tracking_position("counters", "dog_school").await.unwrap(),
        Position::START
    );
}

#[tokio::test]
async fn tracking_must_move_forward() {
    let store = InMemoryEventStore::new();
    let tracking = Tracking::new("counters", "dog_school", Position::new(3));

    store.commit(Commit::tracking_only(tracking.clone())).await.unwrap();
    assert_eq!(
        store.tracking_position("counters", "dog_school").await.unwrap(),
        Position::new(3)
    );

    let replay = store.commit(Commit::tracking_only(tracking)).await;
    assert!(matches!(
        replay,
        Err(EventStoreError::TrackingConflict { stored, attempted, .. })
            if stored == Position::new(3) && attempted == Position::new(3)
    ));
}

#[tokio::test]
async fn notifications_page_in_position_order() {
    let store = InMemoryEventStore::new();
    let fido = AggregateId::from_natural_key("dogs", "Fido");
    let rex = AggregateId::from_natural_key("dogs", "Rex");
    store.append(fido, Version::INITIAL, events(1, 2)).await.unwrap();
    store.append(rex, Version::INITIAL, events(1, 2)).await.unwrap();

    let first = store.read_notifications(Position::START, 3).await.unwrap();
    assert_eq!(first.events.len(), 3);
    assert_eq!(first.next_position, Position::new(3));

    let second = store.read_notifications(first.next_position, 3).await.unwrap();
    let positions: Vec<u64> = second.events.iter().map(|e| e.position.value()).collect();
    assert_eq!(positions, vec![4]);

    let done = store.read_notifications(second.next_position, 3).await.unwrap();
    assert!(done.is_empty());
    assert_eq!(done.next_position, Position::new(4));
    assert_eq!(store.max_position().await.unwrap(), Position::new(4));
}

#[tokio::test]
async fn read_stream_honours_after_and_limit() {
    let store = InMemoryEventStore::new();
    let fido = AggregateId::from_natural_key("dogs", "Fido");
    store.append(fido, Version::INITIAL, events(1, 5)).await.unwrap();

    let tail = store.read_stream(fido, Version::new(2), Some(2)).await.unwrap();
    let versions: Vec<u64> = tail.iter().map(|e| e.version.value()).collect();
    assert_eq!(versions, vec![3, 4]);
    assert!(store
        .read_stream(AggregateId::random(), Version::INITIAL, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn flaky_store_fails_then_recovers() {
    let store = FlakyEventStore::new(Arc::new(InMemoryEventStore::new()));
    store.fail_next(2);

    assert!(matches!(
        store.max_position().await,
        Err(EventStoreError::Unavailable(_))
    ));
    assert!(store.max_position().await.unwrap_err().is_transient());
    assert_eq!(store.max_position().await.unwrap(), Position::START);
    assert_eq!(store.failures_injected(), 2);
}

#[tokio::test]
async fn lost_ack_persists_the_commit_but_reports_unavailable() {
    let inner = Arc::new(InMemoryEventStore::new());
    let store = FlakyEventStore::new(Arc::clone(&inner));
    let fido = AggregateId::from_natural_key("dogs", "Fido");
    store.lose_next_acks(1);

    let result = store.append(fido, Version::INITIAL, events(1, 2)).await;
    assert!(matches!(result, Err(EventStoreError::Unavailable(_))));
    assert_eq!(inner.stream(fido).len(), 2);
    assert_eq!(store.failures_injected(), 1);

    let again = store.append(fido, Version::INITIAL, events(1, 2)).await;
    assert!(matches!(again, Err(EventStoreError::ConcurrencyConflict { .. })));
}

#[tokio::test]
async fn snapshots_load_latest_and_at_or_before() {
    let store = InMemorySnapshotStore::new();
    let fido = AggregateId::from_natural_key("dogs", "Fido");
    for version in [2, 4, 6] {
        store.save_snapshot(snapshot(fido, version)).await.unwrap();
    }

    let latest = store.load_latest(fido).await.unwrap().unwrap();
    assert_eq!(latest.version, Version::new(6));
    let older = store.load_at_or_before(fido, Version::new(5)).await.unwrap().unwrap();
    assert_eq!(older.version, Version::new(4));
    assert!(store.load_at_or_before(fido, Version::new(1)).await.unwrap().is_none());

    store.delete_snapshots(fido).await.unwrap();
    assert!(store.load_latest(fido).await.unwrap().is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn failing_snapshot_store_reports_unavailable() {
    let store = InMemorySnapshotStore::new();
    store.set_failing(true);
    let result = store.save_snapshot(snapshot(AggregateId::random(), 2)).await;
    assert!(matches!(result, Err(EventStoreError::Unavailable(_))));
    store.set_failing(false);
    assert!(store.is_empty());
}

#[tokio::test]
async fn snapshot_store_can_fail_a_few_calls_only() {
    let store = InMemorySnapshotStore::new();
    let fido = AggregateId::random();
    store.fail_next(1);

    assert!(store.save_snapshot(snapshot(fido, 2)).await.unwrap_err().is_transient());
    store.save_snapshot(snapshot(fido, 2)).await.unwrap();
    assert_eq!(store.versions(fido), vec![Version::new(2)]);
}

#[tokio::test]
async fn dead_letter_queue_records_entries() {
    let store = InMemoryEventStore::new();
    let fido = AggregateId::from_natural_key("dogs", "Fido");
    store.append(fido, Version::INITIAL, events(1, 1)).await.unwrap();
    let event = store.notifications().remove(0);

    let queue = InMemoryDeadLetterQueue::new();
    queue
        .record(FailedNotification::new("counters", "dog_school", &event, "boom", 3, Utc::now()))
        .await
        .unwrap();

    let entries = queue.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].position, Position::new(1));
    assert_eq!(entries[0].reference, fido);
    assert_eq!(entries[0].attempts, 3);
}

proptest! {
    #[test]
    fn versions_stay_contiguous(batches in proptest::collection::vec(1u64..4, 1..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = InMemoryEventStore::new();
            let fido = AggregateId::from_natural_key("dogs", "Fido");
            let mut version = 0;
            for count in batches {
                // A stale writer always loses and never leaves events behind.
                if version > 0 {
                    let stale = store.append(fido, Version::new(version - 1), events(version, count)).await;
                    prop_assert!(stale.is_err());
                }
                store.append(fido, Version::new(version), events(version + 1, count)).await.unwrap();
                version += count;
            }

            let stream = store.read_stream(fido, Version::INITIAL, None).await.unwrap();
            let versions: Vec<u64> = stream.iter().map(|e| e.version.value()).collect();
            prop_assert_eq!(versions, (1..=version).collect::<Vec<_>>());
            Ok(())
        })?;
    }
}
