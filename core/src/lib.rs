//! # Rehydrate Core
//!
//! Core traits and types of the rehydrate event-sourcing kernel.
//!
//! This crate has no I/O. It defines what an event-sourced application is
//! made of; `rehydrate-runtime` wires it together and the storage crates
//! implement the store traits.
//!
//! ## Core Concepts
//!
//! - **Aggregate**: a consistency boundary whose value is the fold of its events
//! - **Event**: an immutable, versioned fact about one aggregate
//! - **Event store**: per-aggregate streams plus one global notification sequence
//! - **Snapshot**: a cached replay result, never authoritative
//! - **Registry**: the explicit, immutable table of known aggregate kinds
//!
//! ## Architecture Principles
//!
//! - The mutation engine is pure: `(Option<State>, &Event) -> State`
//! - Optimistic concurrency is the only write-conflict signal
//! - Follower effects are committed together with their tracking position
//! - Dependencies (stores, clock) are injected, never global
//!
//! ## Example
//!
//! ```ignore
//! use rehydrate_core::aggregate::AggregateRoot;
//! use rehydrate_core::stream::AggregateId;
//!
//! let reference = AggregateId::from_natural_key("dogs", "Fido");
//! let mut dog = AggregateRoot::<Dog>::create(
//!     reference,
//!     DogEvent::Registered { name: "Fido".into() },
//!     clock.now(),
//! )?;
//! dog.trigger(DogEvent::TrickAdded { trick: "roll over".into() }, clock.now())?;
//! repository.save(&mut dog).await?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod dead_letter;
pub mod event;
pub mod event_store;
pub mod registry;
pub mod replay;
pub mod snapshot;
pub mod stream;

/// Environment module - injected dependencies
///
/// Everything that would make replay or command handling non-deterministic
/// in tests sits behind a trait here.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use rehydrate_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = chrono::Utc::now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock reading the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use aggregate::{Aggregate, AggregateError, AggregateRoot, MutationError, NaturalKey};
pub use dead_letter::{DeadLetterSink, FailedNotification};
pub use environment::{Clock, SystemClock};
pub use event::{DomainEvent, EventError, NewEvent, StoredEvent};
pub use event_store::{
    AppendBatch, Commit, CommitAck, EventStore, EventStoreError, NotificationBatch, StoreFuture,
    Tracking,
};
pub use registry::{Registry, RegistryBuilder, RegistryError};
pub use replay::ReplayError;
pub use snapshot::{Snapshot, SnapshotStore};
pub use stream::{AggregateId, Position, Version};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
