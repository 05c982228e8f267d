//! # Rehydrate Runtime
//!
//! Wires the pieces of `rehydrate-core` into running applications.
//!
//! ## Core Components
//!
//! - **Application**: one event store with its registry, snapshot store and clock
//! - **Repository**: get, save and create-or-get for one aggregate kind
//! - **ProcessCoordinator**: a follower turning upstream notifications into
//!   downstream events, committed atomically with its tracking position
//! - **System**: explicit wiring of applications and followers, run either
//!   single-threaded or one task per follower
//!
//! ## Example
//!
//! ```ignore
//! use rehydrate_runtime::{Application, FollowerConfig, ProcessCoordinator, System};
//!
//! let school = Application::builder("dog_school", events.clone())
//!     .registry(registry)
//!     .snapshots(snapshots)
//!     .build();
//!
//! let mut fido = school
//!     .repository::<Dog>()
//!     .create_or_get("Fido", || DogEvent::Registered { name: "Fido".into() })
//!     .await?;
//! fido.trigger(DogEvent::TrickAdded { trick: "roll over".into() }, clock.now())?;
//! school.repository::<Dog>().save(&mut fido).await?;
//!
//! let (mut counters, _handle) =
//!     ProcessCoordinator::new("counters", counters_app, Arc::new(CountersPolicy), FollowerConfig::default());
//! counters.follow(school.clone());
//!
//! let mut system = System::builder().application(school).follower(counters).build()?;
//! system.run_until_idle().await?;
//! ```

/// Applications and their builder
pub mod application;

/// Follower coordination
pub mod coordinator;

/// Follower health reporting
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Policies and per-batch processing units
pub mod processing;

/// Aggregate repositories
pub mod repository;

/// Retry logic with exponential backoff
pub mod retry;

/// Applications and followers wired together
pub mod system;

pub use application::{Application, ApplicationBuilder};
pub use coordinator::{
    CycleOutcome, FollowerAlert, FollowerConfig, FollowerConfigBuilder, FollowerError, FollowerHandle,
    FollowerState, ProcessCoordinator, UpstreamStatus,
};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use processing::{Policy, PolicyError, PolicyFuture, ProcessingUnit};
pub use repository::{Repository, RepositoryError};
pub use retry::{RetryPolicy, RetryingEventStore, RetryingSnapshotStore, retry_with_backoff, retry_with_predicate};
pub use system::{RunningSystem, System, SystemBuilder, SystemError};
