//! Hall of fame demo.
//!
//! Four players score, the follower runs on its own task, and the top three
//! are printed before and after Lui's comeback.

use hall_of_fame::{Game, HallOfFame};
use rehydrate_core::event_store::EventStore;
use rehydrate_core::snapshot::SnapshotStore;
use rehydrate_runtime::{FollowerConfig, RetryPolicy, RetryingEventStore, RetryingSnapshotStore, System};
use rehydrate_testing::{InMemoryEventStore, InMemorySnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn wait_for_top(hall: &HallOfFame, expected: &[(&str, u64)]) -> anyhow::Result<Vec<(String, u64)>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let top = hall.top(expected.len()).await?;
        let reached = top.len() == expected.len()
            && top.iter().zip(expected).all(|((name, score), (want, points))| name == want && score == points);
        if reached || tokio::time::Instant::now() >= deadline {
            return Ok(top);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fresh in-memory stores behind the retry decorators.
fn stores() -> (Arc<dyn EventStore>, Option<Arc<dyn SnapshotStore>>) {
    let policy = RetryPolicy::default();
    (
        Arc::new(RetryingEventStore::new(Arc::new(InMemoryEventStore::new()), policy.clone())),
        Some(Arc::new(RetryingSnapshotStore::new(Arc::new(InMemorySnapshotStore::new()), policy))),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hall_of_fame=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (events, snapshots) = stores();
    let game = Game::new(events, snapshots)?;
    let (events, snapshots) = stores();
    let hall = HallOfFame::new(events, snapshots)?;

    let config = FollowerConfig::builder().poll_interval(Duration::from_millis(20)).build();
    let (mut follower, _) = hall.coordinator(config);
    follower.follow(game.application().clone());
    let running = System::builder()
        .application(game.application().clone())
        .application(hall.application().clone())
        .follower(follower)
        .build()?
        .start();

    let john = game.register("John").await?;
    let alice = game.register("Alice").await?;
    let kate = game.register("Kate").await?;
    let lui = game.register("Lui").await?;

    game.add_score(alice, 20).await?;
    game.add_score(kate, 15).await?;
    game.add_score(john, 10).await?;
    game.add_score(lui, 5).await?;
    println!("{:?}", wait_for_top(&hall, &[("Alice", 20), ("Kate", 15), ("John", 10)]).await?);

    game.add_score(lui, 30).await?;
    println!("{:?}", wait_for_top(&hall, &[("Lui", 35), ("Alice", 20), ("Kate", 15)]).await?);

    running.stop().await?;
    Ok(())
}
