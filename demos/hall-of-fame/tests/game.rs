//! Game and hall of fame against in-memory stores.

#![allow(clippy::unwrap_used)]

use hall_of_fame::{Game, GameError, HallOfFame, HallOfFamePolicy, HighScoreTable};
use rehydrate_core::aggregate::NaturalKey;
use rehydrate_core::event_store::{EventStore, Tracking};
use rehydrate_core::stream::{AggregateId, Position, Version};
use rehydrate_runtime::{FollowerConfig, Policy, ProcessingUnit, System};
use rehydrate_testing::{InMemoryEventStore, InMemorySnapshotStore};
use std::sync::Arc;
use std::time::Duration;

fn game() -> (Game, Arc<InMemorySnapshotStore>) {
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let game = Game::new(Arc::new(InMemoryEventStore::new()), Some(snapshots.clone())).unwrap();
    (game, snapshots)
}

fn expect(rows: &[(&str, u64)]) -> Vec<(String, u64)> {
    rows.iter().map(|(name, score)| ((*name).to_string(), *score)).collect()
}

#[tokio::test]
async fn registered_player_can_be_read_back() {
    let (game, _) = game();

    let john = game.register("John").await.unwrap();

    assert_eq!(john, hall_of_fame::Player::reference_for("JOHN"));
    assert_eq!(game.get(john).await.unwrap().name, "John");
    assert_eq!(game.register("john").await.unwrap(), john);
}

#[tokio::test]
async fn scores_accumulate() {
    let (game, _) = game();
    let john = game.register("John").await.unwrap();

    game.add_score(john, 10).await.unwrap();
    game.add_score(john, 20).await.unwrap();

    assert_eq!(game.get(john).await.unwrap().score, 30);
}

#[tokio::test]
async fn unknown_player_is_not_found() {
    let (game, _) = game();
    let ghost = AggregateId::random();

    assert!(matches!(game.add_score(ghost, 1).await, Err(GameError::PlayerNotFound(id)) if id == ghost));
    assert!(matches!(game.get(ghost).await, Err(GameError::PlayerNotFound(_))));
}

#[tokio::test]
async fn players_are_snapshotted_every_ten_versions() {
    let (game, snapshots) = game();
    let john = game.register("John").await.unwrap();
    for _ in 0..10 {
        game.add_score(john, 1).await.unwrap();
    }

    assert_eq!(snapshots.versions(john), vec![Version::new(10)]);
    assert_eq!(game.get(john).await.unwrap().score, 10);
}

#[tokio::test]
async fn hall_of_fame_ranks_players() {
    let (game, _) = game();
    let hall = HallOfFame::new(Arc::new(InMemoryEventStore::new()), None).unwrap();
    let (mut follower, _) = hall.coordinator(FollowerConfig::default());
    follower.follow(game.application().clone());
    let mut system = System::builder()
        .application(game.application().clone())
        .application(hall.application().clone())
        .follower(follower)
        .build()
        .unwrap();

    assert!(hall.top(3).await.unwrap().is_empty());

    let john = game.register("John").await.unwrap();
    let alice = game.register("Alice").await.unwrap();
    let kate = game.register("Kate").await.unwrap();
    let lui = game.register("Lui").await.unwrap();
    game.add_score(alice, 20).await.unwrap();
    game.add_score(kate, 15).await.unwrap();
    game.add_score(john, 10).await.unwrap();
    game.add_score(lui, 5).await.unwrap();
    system.run_until_idle().await.unwrap();

    assert_eq!(
        hall.top(3).await.unwrap(),
        expect(&[("Alice", 20), ("Kate", 15), ("John", 10)])
    );

    game.add_score(lui, 30).await.unwrap();
    system.run_until_idle().await.unwrap();

    assert_eq!(
        hall.top(3).await.unwrap(),
        expect(&[("Lui", 35), ("Alice", 20), ("Kate", 15)])
    );
}

#[tokio::test]
async fn replayed_scores_are_not_counted_twice() {
    let (game, _) = game();
    let hall_events = Arc::new(InMemoryEventStore::new());
    let hall = HallOfFame::new(hall_events.clone(), None).unwrap();
    let john = game.register("John").await.unwrap();
    game.add_score(john, 10).await.unwrap();
    let batch = game
        .application()
        .events()
        .read_notifications(Position::START, 10)
        .await
        .unwrap();

    // Two independent cursors deliver the same notifications.
    for follower in ["first", "second"] {
        let mut unit = ProcessingUnit::new(hall.application().clone());
        for event in &batch.events {
            HallOfFamePolicy.process(Game::NAME, event, &mut unit).await.unwrap();
        }
        let tracking = Tracking::new(follower, Game::NAME, batch.next_position);
        hall.application().commit(unit.into_commit(tracking)).await.unwrap();
    }

    assert_eq!(hall.top(1).await.unwrap(), expect(&[("John", 10)]));
    assert_eq!(hall_events.stream(HighScoreTable::reference()).len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hall_of_fame_catches_up_on_its_own_task() {
    let (game, _) = game();
    let hall = HallOfFame::new(Arc::new(InMemoryEventStore::new()), None).unwrap();
    let config = FollowerConfig::builder().poll_interval(Duration::from_millis(10)).build();
    let (mut follower, _) = hall.coordinator(config);
    follower.follow(game.application().clone());
    let running = System::builder()
        .application(game.application().clone())
        .application(hall.application().clone())
        .follower(follower)
        .build()
        .unwrap()
        .start();

    let alice = game.register("Alice").await.unwrap();
    let bob = game.register("Bob").await.unwrap();
    game.add_score(alice, 7).await.unwrap();
    game.add_score(bob, 9).await.unwrap();

    let expected = expect(&[("Bob", 9), ("Alice", 7)]);
    tokio::time::timeout(Duration::from_secs(10), async {
        while hall.top(2).await.unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    running.stop().await.unwrap();
}
