//! # Rehydrate Testing
//!
//! Testing utilities for the rehydrate event-sourcing kernel.
//!
//! This crate provides:
//! - In-memory event, snapshot and dead-letter stores
//! - A fault-injecting event store wrapper
//! - A fixed clock for deterministic timestamps
//! - A Given-When-Then harness for aggregates
//!
//! The in-memory stores are complete implementations of the store traits, so
//! demo binaries use them as their default persistence too.
//!
//! ## Example
//!
//! ```ignore
//! use rehydrate_testing::{InMemoryEventStore, InMemorySnapshotStore, test_clock};
//! use rehydrate_runtime::Application;
//!
//! #[tokio::test]
//! async fn register_dog() {
//!     let app = Application::builder("dog_school", Arc::new(InMemoryEventStore::new()))
//!         .snapshots(Arc::new(InMemorySnapshotStore::new()))
//!         .clock(Arc::new(test_clock()))
//!         .registry(Registry::builder().register::<Dog>().build()?)
//!         .build();
//!
//!     let dog = app.repository::<Dog>().create_or_get("Fido", || DogEvent::registered("Fido")).await?;
//!     assert_eq!(dog.version(), Version::new(1));
//! }
//! ```

use rehydrate_core::environment::Clock;
use rehydrate_core::{DateTime, Utc};

mod dead_letters;
mod event_store;
mod snapshot_store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until it is moved with [`FixedClock::advance`].
    /// Clones share the current time.
    ///
    /// # Example
    ///
    /// ```
    /// use rehydrate_testing::mocks::FixedClock;
    /// use rehydrate_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// assert_eq!(time1, clock.now());
    ///
    /// clock.advance(Duration::seconds(5));
    /// assert_eq!(clock.now() - time1, Duration::seconds(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

pub use aggregate_test::AggregateTest;
pub use dead_letters::InMemoryDeadLetterQueue;
pub use event_store::{FlakyEventStore, InMemoryEventStore};
pub use mocks::{FixedClock, test_clock};
pub use snapshot_store::InMemorySnapshotStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn clones_share_time() {
        let clock = test_clock();
        let other = clock.clone();
        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(other.now(), clock.now());
    }
}
