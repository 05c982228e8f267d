//! Follower behaviour: delivery, idempotence, poison handling, stop and resume.

#![allow(clippy::unwrap_used)]

mod common;

use common::{Counter, Dog, TrickCounter, add_tricks, count, deployment};
use rehydrate_core::Clock;
use rehydrate_core::aggregate::NaturalKey;
use rehydrate_core::event::{NewEvent, StoredEvent};
use rehydrate_core::event_store::{Commit, EventStore, EventStoreError, Tracking};
use rehydrate_core::registry::Registry;
use rehydrate_core::stream::{Position, Version};
use rehydrate_runtime::{
    Application, CycleOutcome, FollowerAlert, FollowerConfig, FollowerError, FollowerState, HealthStatus,
    Policy, PolicyError, PolicyFuture, ProcessCoordinator, ProcessingUnit, RepositoryError, RetryPolicy,
    System, SystemError, UpstreamStatus,
};
use rehydrate_testing::{InMemoryDeadLetterQueue, InMemorySnapshotStore, test_clock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn config() -> FollowerConfig {
    FollowerConfig::builder()
        .poll_interval(Duration::from_millis(10))
        .store_retry(RetryPolicy::none())
        .build()
}

#[tokio::test]
async fn counter_follows_tricks() {
    let d = deployment();
    let (mut counters, _handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());

    add_tricks(&d.school, "Fido", &["roll over"]).await;
    assert_eq!(count(&d.counters, "roll over").await, 0);

    let outcome = counters.process_next("dog_school").await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Committed {
            notifications: 2,
            position: Position::new(2),
        }
    );
    assert_eq!(count(&d.counters, "roll over").await, 1);
    assert_eq!(
        d.counters_store.tracking_position("counters", "dog_school").await.unwrap(),
        Position::new(2)
    );
    assert_eq!(counters.process_next("dog_school").await.unwrap(), CycleOutcome::Idle);
}

#[tokio::test]
async fn billy_milly_scrappy_counts() {
    let d = deployment();
    let (mut counters, _handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());

    add_tricks(&d.school, "Billy", &["roll over", "fetch ball"]).await;
    add_tricks(&d.school, "Milly", &["roll over", "fetch ball"]).await;
    add_tricks(&d.school, "Scrappy", &["roll over", "play dead"]).await;

    let processed = counters.run_until_idle().await.unwrap();
    assert_eq!(processed, 9);
    assert_eq!(count(&d.counters, "roll over").await, 3);
    assert_eq!(count(&d.counters, "fetch ball").await, 2);
    assert_eq!(count(&d.counters, "play dead").await, 1);
    assert_eq!(count(&d.counters, "sit").await, 0);
}

#[tokio::test]
async fn two_notifications_in_one_batch_share_the_downstream_root() {
    let d = deployment();
    let (mut counters, _handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());

    add_tricks(&d.school, "Fido", &["sit", "sit", "sit"]).await;
    counters.process_next("dog_school").await.unwrap();

    let counter = d.counters.repository::<Counter>().get_by_key("sit").await.unwrap();
    assert_eq!(counter.state().count, 3);
    assert_eq!(counter.version(), Version::new(4));
}

#[tokio::test]
async fn follower_commits_snapshot_downstream_aggregates_on_their_interval() {
    let d = deployment();
    let snapshots = InMemorySnapshotStore::new();
    let counters = Application::builder("counters", Arc::new(d.counters_store.clone()))
        .snapshots(Arc::new(snapshots.clone()))
        .registry(Registry::builder().snapshot_interval::<Counter>(2).build().unwrap())
        .clock(Arc::new(test_clock()))
        .build();
    let (mut follower, _handle) =
        ProcessCoordinator::new("counters", counters.clone(), Arc::new(TrickCounter::default()), config());
    follower.follow(d.school.clone());
    let sit = Counter::reference_for("sit");

    // Started plus three increments: one commit lands the counter on version 4.
    add_tricks(&d.school, "Fido", &["sit", "sit", "sit"]).await;
    follower.run_until_idle().await.unwrap();
    assert_eq!(snapshots.versions(sit), vec![Version::new(4)]);

    add_tricks(&d.school, "Rex", &["sit"]).await;
    follower.run_until_idle().await.unwrap();
    assert_eq!(snapshots.versions(sit), vec![Version::new(4)]);

    add_tricks(&d.school, "Rex", &["sit"]).await;
    follower.run_until_idle().await.unwrap();
    assert_eq!(snapshots.versions(sit), vec![Version::new(4), Version::new(6)]);

    // Loading from the newest snapshot agrees with the full history.
    let counter = counters.repository::<Counter>().get(sit).await.unwrap();
    assert_eq!(counter.version(), Version::new(6));
    assert_eq!(counter.state().count, 5);
}

#[tokio::test]
async fn recommitting_the_same_batch_is_a_redelivery() {
    let d = deployment();
    add_tricks(&d.school, "Fido", &["roll over"]).await;
    let policy = TrickCounter::default();
    let batch = d.school.events().read_notifications(Position::START, 10).await.unwrap();

    let mut unit = ProcessingUnit::new(d.counters.clone());
    for event in &batch.events {
        policy.process("dog_school", event, &mut unit).await.unwrap();
    }
    let first = unit.into_commit(Tracking::new("counters", "dog_school", batch.next_position));
    let second = first.clone();
    d.counters.commit(first).await.unwrap();
    let replay = d.counters.commit(second).await;

    assert!(matches!(
        replay,
        Err(EventStoreError::TrackingConflict { .. })
    ));
    assert_eq!(count(&d.counters, "roll over").await, 1);

    // A follower rebuilt from scratch after the crash resumes past the batch.
    let (mut counters, _handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());
    assert_eq!(counters.process_next("dog_school").await.unwrap(), CycleOutcome::Idle);
    assert_eq!(count(&d.counters, "roll over").await, 1);
}

#[tokio::test]
async fn stale_tracking_commit_is_discarded_as_redelivery() {
    let d = deployment();
    add_tricks(&d.school, "Fido", &["roll over"]).await;

    // Another instance of the follower already committed this range.
    d.counters_store
        .commit(Commit::tracking_only(Tracking::new("counters", "dog_school", Position::new(2))))
        .await
        .unwrap();

    let (mut counters, _handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());
    assert_eq!(counters.process_next("dog_school").await.unwrap(), CycleOutcome::Idle);
    assert_eq!(count(&d.counters, "roll over").await, 0);
}

#[tokio::test]
async fn poison_notification_stalls_until_skipped() {
    let d = deployment();
    let dead_letters = InMemoryDeadLetterQueue::new();
    let (counters, handle) = ProcessCoordinator::new(
        "counters",
        d.counters.clone(),
        Arc::new(TrickCounter::refusing("bite")),
        FollowerConfig::builder().max_attempts(2).store_retry(RetryPolicy::none()).build(),
    );
    let mut counters = counters.with_dead_letters(Arc::new(dead_letters.clone()));
    counters.follow(d.school.clone());
    let mut alerts = handle.alerts();

    add_tricks(&d.school, "Fido", &["sit", "bite", "stay"]).await;

    // Positions: 1 registered, 2 sit, 3 bite, 4 stay. The prefix commits first.
    assert_eq!(
        counters.process_next("dog_school").await.unwrap(),
        CycleOutcome::PolicyFailed { position: Position::new(3) }
    );
    assert!(matches!(
        counters.process_next("dog_school").await.unwrap(),
        CycleOutcome::Committed { position, .. } if position == Position::new(2)
    ));
    assert_eq!(count(&d.counters, "sit").await, 1);

    assert_eq!(
        counters.process_next("dog_school").await.unwrap(),
        CycleOutcome::Stalled { position: Position::new(3) }
    );
    assert_eq!(handle.status("dog_school"), Some(UpstreamStatus::Stalled { position: Position::new(3) }));
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters.entries()[0].attempts, 2);
    assert_eq!(count(&d.counters, "stay").await, 0);

    assert!(matches!(alerts.recv().await.unwrap(), FollowerAlert::PolicyFailed { attempts: 1, .. }));
    assert!(matches!(alerts.recv().await.unwrap(), FollowerAlert::PolicyFailed { attempts: 2, .. }));
    assert!(matches!(
        alerts.recv().await.unwrap(),
        FollowerAlert::Poisoned { position, .. } if position == Position::new(3)
    ));

    handle.skip("dog_school", Position::new(3)).unwrap();
    counters.run_until_idle().await.unwrap();

    assert_eq!(handle.status("dog_school"), Some(UpstreamStatus::Running));
    assert_eq!(count(&d.counters, "stay").await, 1);
    assert_eq!(count(&d.counters, "bite").await, 0);
    assert_eq!(
        d.counters_store.tracking_position("counters", "dog_school").await.unwrap(),
        Position::new(4)
    );
}

/// Fails its first `outages` calls as if the downstream store were offline.
struct Unreliable {
    outages: u32,
    calls: AtomicU32,
    inner: TrickCounter,
}

impl Unreliable {
    fn new(outages: u32) -> Self {
        Self {
            outages,
            calls: AtomicU32::new(0),
            inner: TrickCounter::default(),
        }
    }
}

impl Policy for Unreliable {
    fn process<'a>(
        &'a self,
        upstream: &'a str,
        event: &'a StoredEvent,
        unit: &'a mut ProcessingUnit,
    ) -> PolicyFuture<'a> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.outages {
            return Box::pin(async {
                Err(PolicyError::Repository(RepositoryError::Storage(
                    EventStoreError::Unavailable("connection reset".to_string()),
                )))
            });
        }
        self.inner.process(upstream, event, unit)
    }
}

fn backoff(initial_ms: u64, max_retries: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(initial_ms))
        .build()
}

#[tokio::test]
async fn unavailable_storage_in_a_policy_backs_off_without_poisoning() {
    let d = deployment();
    let (mut counters, handle) = ProcessCoordinator::new(
        "counters",
        d.counters.clone(),
        Arc::new(Unreliable::new(3)),
        FollowerConfig::builder().max_attempts(1).store_retry(backoff(20, 5)).build(),
    );
    counters.follow(d.school.clone());
    add_tricks(&d.school, "Fido", &["sit"]).await;
    let started = Instant::now();

    let first = counters.process_next("dog_school").await.unwrap();
    assert!(matches!(first, CycleOutcome::Backoff { .. }));
    assert_eq!(counters.process_next("dog_school").await.unwrap(), first);

    // Delays of 20, 40 and 80ms, then the fourth call goes through.
    assert_eq!(counters.run_until_idle().await.unwrap(), 2);
    assert!(started.elapsed() >= Duration::from_millis(140));
    assert_eq!(handle.status("dog_school"), Some(UpstreamStatus::Running));
    assert_eq!(count(&d.counters, "sit").await, 1);
}

#[tokio::test]
async fn lasting_storage_outage_in_a_policy_is_a_storage_error() {
    let d = deployment();
    let (mut counters, handle) = ProcessCoordinator::new(
        "counters",
        d.counters.clone(),
        Arc::new(Unreliable::new(u32::MAX)),
        FollowerConfig::builder().store_retry(backoff(1, 2)).build(),
    );
    counters.follow(d.school.clone());
    add_tricks(&d.school, "Fido", &["sit"]).await;

    let result = counters.run_until_idle().await;

    assert!(matches!(
        result,
        Err(FollowerError::Storage { source: EventStoreError::Unavailable(_), .. })
    ));
    assert_eq!(handle.status("dog_school"), Some(UpstreamStatus::Running));
}

#[tokio::test]
async fn failing_policy_waits_before_each_retry() {
    let d = deployment();
    let (mut counters, handle) = ProcessCoordinator::new(
        "counters",
        d.counters.clone(),
        Arc::new(TrickCounter::refusing("bite")),
        FollowerConfig::builder().max_attempts(3).store_retry(backoff(30, 0)).build(),
    );
    counters.follow(d.school.clone());
    add_tricks(&d.school, "Fido", &["bite"]).await;
    let started = Instant::now();

    counters.run_until_idle().await.unwrap();

    // The first failure only clips the batch so the registration commits;
    // the retry after the second failure waits 60ms.
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(handle.status("dog_school"), Some(UpstreamStatus::Stalled { position: Position::new(2) }));
}

#[tokio::test]
async fn skip_is_refused_unless_stalled_at_that_position() {
    let d = deployment();
    let (mut counters, _handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());

    let result = counters.skip("dog_school", Position::new(1)).await;
    assert!(matches!(result, Err(FollowerError::NotStalled { .. })));
    let unknown = counters.process_next("elsewhere").await;
    assert!(matches!(unknown, Err(FollowerError::UnknownUpstream { .. })));
}

#[tokio::test]
async fn retry_processes_the_poison_notification_again() {
    let d = deployment();
    let (mut counters, handle) = ProcessCoordinator::new(
        "counters",
        d.counters.clone(),
        Arc::new(TrickCounter::refusing("bite")),
        FollowerConfig::builder().max_attempts(1).store_retry(RetryPolicy::none()).build(),
    );
    counters.follow(d.school.clone());
    add_tricks(&d.school, "Fido", &["bite"]).await;

    counters.run_until_idle().await.unwrap();
    assert_eq!(handle.status("dog_school"), Some(UpstreamStatus::Stalled { position: Position::new(2) }));

    handle.retry("dog_school").unwrap();
    counters.run_until_idle().await.unwrap();
    // Still refused, so stalled again at the same place.
    assert_eq!(handle.status("dog_school"), Some(UpstreamStatus::Stalled { position: Position::new(2) }));
}

#[tokio::test]
async fn unknown_event_type_halts_the_follower() {
    let d = deployment();
    add_tricks(&d.school, "Fido", &[]).await;
    let rogue = NewEvent {
        kind: "dog".to_string(),
        event_type: "Dog.Adopted".to_string(),
        version: Version::new(2),
        schema_version: 1,
        data: Vec::new(),
        timestamp: test_clock().now(),
    };
    d.school_store
        .append(Dog::reference_for("Fido"), Version::new(1), vec![rogue])
        .await
        .unwrap();

    let (mut counters, handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());

    let result = counters.spawn().await.unwrap();
    assert!(matches!(result, Err(ref e) if e.is_fatal()));
    assert_eq!(handle.state(), FollowerState::Stopped);
    assert_eq!(
        d.counters_store.tracking_position("counters", "dog_school").await.unwrap(),
        Position::START
    );
}

#[tokio::test]
async fn stopped_follower_resumes_where_it_left_off() {
    let d = deployment();
    add_tricks(&d.school, "Fido", &["sit"]).await;

    let (mut counters, handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());
    let task = counters.spawn();

    let mut tracking = Position::START;
    for _ in 0..200 {
        tracking = d.counters_store.tracking_position("counters", "dog_school").await.unwrap();
        if tracking == Position::new(2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(tracking, Position::new(2));

    handle.stop();
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), FollowerState::Stopped);

    add_tricks(&d.school, "Fido", &["sit"]).await;
    assert_eq!(count(&d.counters, "sit").await, 1);

    let (mut resumed, _handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    resumed.follow(d.school.clone());
    assert_eq!(resumed.run_until_idle().await.unwrap(), 1);
    assert_eq!(count(&d.counters, "sit").await, 2);
}

#[tokio::test]
async fn system_runs_followers_until_idle() {
    let d = deployment();
    let (mut counters, _handle) =
        ProcessCoordinator::new("counters", d.counters.clone(), Arc::new(TrickCounter::default()), config());
    counters.follow(d.school.clone());

    let mut system = System::builder()
        .application(d.school.clone())
        .application(d.counters.clone())
        .follower(counters)
        .build()
        .unwrap();

    add_tricks(&d.school, "Fido", &["roll over", "play dead"]).await;
    assert_eq!(system.run_until_idle().await.unwrap(), 3);
    assert_eq!(system.run_until_idle().await.unwrap(), 0);
    assert_eq!(count(&d.counters, "play dead").await, 1);
    assert!(system.application("counters").is_some());
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let d = deployment();
    let result = System::builder()
        .application(d.school.clone())
        .application(d.school.clone())
        .build();
    assert!(matches!(result, Err(SystemError::DuplicateName(name)) if name == "dog_school"));
}

#[tokio::test]
async fn running_system_reports_health_and_stops() {
    let d = deployment();
    let (mut counters, _handle) = ProcessCoordinator::new(
        "counters",
        d.counters.clone(),
        Arc::new(TrickCounter::refusing("bite")),
        FollowerConfig::builder()
            .max_attempts(1)
            .poll_interval(Duration::from_millis(10))
            .store_retry(RetryPolicy::none())
            .build(),
    );
    counters.follow(d.school.clone());

    let running = System::builder()
        .application(d.school.clone())
        .application(d.counters.clone())
        .follower(counters)
        .build()
        .unwrap()
        .start();

    add_tricks(&d.school, "Fido", &["bite"]).await;
    let handle = running.follower("counters").unwrap().clone();
    for _ in 0..200 {
        if matches!(handle.status("dog_school"), Some(UpstreamStatus::Stalled { .. })) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = running.health();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(report.check("counters").unwrap().message.is_some());

    running.stop().await.unwrap();
    handle.stopped().await;
    assert_eq!(handle.state(), FollowerState::Stopped);
}
