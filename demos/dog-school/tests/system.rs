//! The whole dog school system, single-task and multi-task.

#![allow(clippy::unwrap_used)]

use dog_school::{DogSchoolSystem, Persistence};
use rehydrate_runtime::{FollowerConfig, HealthStatus};
use std::time::Duration;

const SESSION: &[(&str, &[&str])] = &[
    ("Billy", &["roll over", "fetch ball"]),
    ("Milly", &["roll over", "fetch ball"]),
    ("Scrappy", &["roll over", "play dead"]),
];

const EXPECTED: &[(&str, u64)] = &[
    ("Billy", 1),
    ("Milly", 1),
    ("Scrappy", 1),
    ("roll over", 3),
    ("fetch ball", 2),
    ("play dead", 1),
    ("sit", 0),
];

fn config() -> FollowerConfig {
    FollowerConfig::builder()
        .batch_size(4)
        .poll_interval(Duration::from_millis(10))
        .build()
}

#[tokio::test]
async fn counters_follow_the_school_in_one_task() {
    let mut system = DogSchoolSystem::open(&Persistence::memory(), config()).await.unwrap();

    for (dog, tricks) in SESSION {
        system.school().register_dog(dog).await.unwrap();
        for trick in *tricks {
            system.school().add_trick(dog, trick).await.unwrap();
        }
    }

    let processed = system.run_until_idle().await.unwrap();

    for (name, count) in EXPECTED {
        assert_eq!(system.counters().get_count(name).await.unwrap(), *count, "{name}");
    }
    // 9 school events feed counters; printers sees those 9 plus 6 counter
    // creations and 9 increments.
    assert_eq!(system.printers().printed(), 24);
    assert_eq!(processed, 9 + 24);
    assert_eq!(system.run_until_idle().await.unwrap(), 0);
}

#[tokio::test]
async fn registering_again_does_not_count_twice() {
    let mut system = DogSchoolSystem::open(&Persistence::memory(), config()).await.unwrap();

    system.school().register_dog("Billy").await.unwrap();
    system.run_until_idle().await.unwrap();
    system.school().register_dog("Billy").await.unwrap();
    system.run_until_idle().await.unwrap();

    assert_eq!(system.counters().get_count("Billy").await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn counters_follow_the_school_on_their_own_tasks() {
    let running = DogSchoolSystem::open(&Persistence::memory(), config())
        .await
        .unwrap()
        .start();

    for (dog, tricks) in SESSION {
        running.school().register_dog(dog).await.unwrap();
        for trick in *tricks {
            running.school().add_trick(dog, trick).await.unwrap();
        }
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while running.printers().printed() < 24 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    for (name, count) in EXPECTED {
        assert_eq!(running.counters().get_count(name).await.unwrap(), *count, "{name}");
    }

    let health = running.health();
    assert!(health.is_healthy());
    assert_eq!(health.check("counters").unwrap().status, HealthStatus::Healthy);

    running.stop().await.unwrap();
}
