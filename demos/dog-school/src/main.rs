//! Dog school demo.
//!
//! Registers three dogs, teaches them tricks, lets the followers catch up
//! and prints what the counters saw.
//!
//! ```bash
//! cargo run -p dog-school
//! REHYDRATE_PERSISTENCE=postgres DATABASE_URL=postgres://localhost/rehydrate \
//!     cargo run -p dog-school --features postgres
//! ```
//!
//! Set `METRICS_ADDR` (e.g. `0.0.0.0:9090`) to install the Prometheus recorder.

use dog_school::{DogSchoolSystem, Persistence};
use rehydrate_runtime::FollowerConfig;
use rehydrate_runtime::metrics::MetricsServer;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SESSION: &[(&str, &[&str])] = &[
    ("Billy", &["roll over", "fetch ball"]),
    ("Milly", &["roll over", "fetch ball"]),
    ("Scrappy", &["roll over", "play dead"]),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rehydrate_runtime=info,dog_school=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let mut metrics = MetricsServer::new(addr.parse()?);
        metrics.start()?;
    }

    let persistence = Persistence::from_env().await?;
    let config = FollowerConfig::builder()
        .poll_interval(Duration::from_millis(50))
        .build();
    let running = DogSchoolSystem::open(&persistence, config).await?.start();

    let school = running.school();
    for (dog, tricks) in SESSION {
        school.register_dog(dog).await?;
        for trick in *tricks {
            school.add_trick(dog, trick).await?;
        }
    }

    let billy = school.get_dog("Billy").await?;
    println!("{}", serde_json::to_string_pretty(&billy)?);

    let counters = running.counters();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while counters.get_count("roll over").await? < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for name in ["Billy", "Milly", "Scrappy", "roll over", "fetch ball", "play dead"] {
        println!("{name}: {}", counters.get_count(name).await?);
    }

    let health = running.health();
    tracing::info!(healthy = health.is_healthy(), printed = running.printers().printed(), "Session done");

    running.stop().await?;
    Ok(())
}
