//! Retry decorators over flaky stores.

#![allow(clippy::unwrap_used)]

mod common;

use common::{Dog, DogEvent, add_tricks, dog_registry};
use rehydrate_core::aggregate::{AggregateRoot, NaturalKey};
use rehydrate_core::event::NewEvent;
use rehydrate_core::event_store::{AppendBatch, Commit, EventStore, EventStoreError, Tracking};
use rehydrate_core::snapshot::SnapshotStore;
use rehydrate_core::stream::{AggregateId, Position, Version};
use rehydrate_core::Clock;
use rehydrate_runtime::{Application, RepositoryError, RetryPolicy, RetryingEventStore, RetryingSnapshotStore};
use rehydrate_testing::{FlakyEventStore, InMemoryEventStore, InMemorySnapshotStore, test_clock};
use std::sync::Arc;
use std::time::Duration;

fn fast(max_retries: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(1))
        .build()
}

fn registration(name: &str) -> Vec<NewEvent> {
    vec![NewEvent::from_domain("dog", &DogEvent::registered(name), Version::new(1), test_clock().now()).unwrap()]
}

#[tokio::test]
async fn untracked_commit_with_unknown_outcome_is_not_retried() {
    let inner = Arc::new(InMemoryEventStore::new());
    let flaky = Arc::new(FlakyEventStore::new(Arc::clone(&inner)));
    let app = Application::builder("dog_school", Arc::new(RetryingEventStore::new(Arc::clone(&flaky), fast(3))))
        .registry(dog_registry())
        .build();
    add_tricks(&app, "Fido", &[]).await;

    let repository = app.repository::<Dog>();
    let mut fido = repository.get_by_key("Fido").await.unwrap();
    fido.trigger(DogEvent::trick("sit"), test_clock().now()).unwrap();
    flaky.lose_next_acks(1);

    let result = repository.save(&mut fido).await;
    assert!(matches!(
        result,
        Err(RepositoryError::Storage(EventStoreError::Unavailable(_)))
    ));
    assert_eq!(flaky.failures_injected(), 1);

    let reloaded = repository.get_by_key("Fido").await.unwrap();
    assert_eq!(reloaded.state().tricks, vec!["sit"]);
    assert_eq!(inner.stream(Dog::reference_for("Fido")).len(), 2);
}

#[tokio::test]
async fn tracked_commit_is_retried_until_it_lands() {
    let flaky = Arc::new(FlakyEventStore::new(Arc::new(InMemoryEventStore::new())));
    let store = RetryingEventStore::new(Arc::clone(&flaky), fast(3));
    let fido = Dog::reference_for("Fido");
    let commit = Commit {
        batches: vec![AppendBatch::new(fido, Version::INITIAL, registration("Fido"))],
        tracking: Some(Tracking::new("counters", "dog_school", Position::new(1))),
    };

    flaky.fail_next(2);
    let ack = store.commit(commit).await.unwrap();

    assert_eq!(ack.version_of(fido), Some(Version::new(1)));
    assert_eq!(flaky.failures_injected(), 2);
    assert_eq!(store.tracking_position("counters", "dog_school").await.unwrap(), Position::new(1));
}

#[tokio::test]
async fn landed_retry_of_a_tracked_commit_is_a_tracking_conflict() {
    let inner = Arc::new(InMemoryEventStore::new());
    let flaky = Arc::new(FlakyEventStore::new(Arc::clone(&inner)));
    let store = RetryingEventStore::new(Arc::clone(&flaky), fast(3));
    let fido = Dog::reference_for("Fido");
    let commit = Commit {
        batches: vec![AppendBatch::new(fido, Version::INITIAL, registration("Fido"))],
        tracking: Some(Tracking::new("counters", "dog_school", Position::new(1))),
    };

    flaky.lose_next_acks(1);
    let result = store.commit(commit).await;

    assert!(matches!(result, Err(EventStoreError::TrackingConflict { .. })));
    assert_eq!(inner.stream(fido).len(), 1);
}

#[tokio::test]
async fn snapshot_decorator_retries_transient_failures() {
    let inner = InMemorySnapshotStore::new();
    let store = RetryingSnapshotStore::new(Arc::new(inner.clone()), fast(3));
    let root = AggregateRoot::<Dog>::create(Dog::reference_for("Fido"), DogEvent::registered("Fido"), test_clock().now())
        .unwrap();
    let snapshot = root.to_snapshot(test_clock().now()).unwrap();

    inner.fail_next(2);
    store.save_snapshot(snapshot.clone()).await.unwrap();

    inner.fail_next(3);
    let loaded = store.load_latest(snapshot.reference).await.unwrap();
    assert_eq!(loaded, Some(snapshot));
}

#[tokio::test]
async fn snapshot_decorator_gives_up_after_its_retries() {
    let inner = InMemorySnapshotStore::new();
    let store = RetryingSnapshotStore::new(Arc::new(inner.clone()), fast(1));

    inner.fail_next(2);
    let result = store.delete_snapshots(AggregateId::random()).await;
    assert!(matches!(result, Err(EventStoreError::Unavailable(_))));

    inner.set_failing(true);
    assert!(store.load_latest(AggregateId::random()).await.is_err());
}
