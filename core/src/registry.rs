//! Registry of aggregate kinds and event types.
//!
//! Every application is built with an explicit [`Registry`] naming the
//! aggregate kinds it stores. The registry is immutable once built and shared
//! through an `Arc`; there is no process-wide table to mutate at runtime.
//!
//! # Example
//!
//! ```ignore
//! let registry = Registry::builder()
//!     .register::<Dog>()
//!     .snapshot_interval::<Dog>(100)
//!     .build()?;
//!
//! assert_eq!(registry.snapshot_interval("dog"), Some(100));
//! ```

use crate::aggregate::Aggregate;
use crate::event::DomainEvent;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while building or consulting a registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The aggregate kind was never registered.
    #[error("Unknown aggregate kind: {0}")]
    UnknownKind(String),

    /// The kind is registered but does not produce this event type.
    #[error("Unknown event type {event_type} for aggregate kind {kind}")]
    UnknownEventType {
        /// The aggregate kind.
        kind: String,
        /// The unrecognised tag.
        event_type: String,
    },

    /// Two kinds claim the same event type tag.
    #[error("Event type {event_type} is claimed by both {first} and {second}")]
    DuplicateEventType {
        /// The contested tag.
        event_type: String,
        /// Kind registered first.
        first: String,
        /// Kind registered second.
        second: String,
    },

    /// A snapshot interval of zero was configured.
    #[error("Snapshot interval for {0} must be greater than zero")]
    ZeroInterval(String),
}

#[derive(Clone, Debug)]
struct KindEntry {
    event_types: &'static [&'static str],
    snapshot_interval: Option<u64>,
}

/// Immutable table of the aggregate kinds an application knows.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    kinds: BTreeMap<&'static str, KindEntry>,
}

impl Registry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Whether the kind is registered.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kinds, in name order.
    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }

    /// Snapshot interval of a kind, if snapshots are enabled for it.
    #[must_use]
    pub fn snapshot_interval(&self, kind: &str) -> Option<u64> {
        self.kinds.get(kind).and_then(|e| e.snapshot_interval)
    }

    /// Check that `event_type` is a known tag of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownKind`] or
    /// [`RegistryError::UnknownEventType`].
    pub fn check(&self, kind: &str, event_type: &str) -> Result<(), RegistryError> {
        let entry = self
            .kinds
            .get(kind)
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))?;
        if entry.event_types.contains(&event_type) {
            Ok(())
        } else {
            Err(RegistryError::UnknownEventType {
                kind: kind.to_string(),
                event_type: event_type.to_string(),
            })
        }
    }
}

/// Builder for [`Registry`].
#[derive(Clone, Debug, Default)]
pub struct RegistryBuilder {
    kinds: BTreeMap<&'static str, KindEntry>,
    intervals: Vec<(&'static str, Option<u64>)>,
}

impl RegistryBuilder {
    /// Register an aggregate kind with its default snapshot interval.
    #[must_use]
    pub fn register<A: Aggregate>(mut self) -> Self {
        self.kinds.insert(
            A::KIND,
            KindEntry {
                event_types: <A::Event as DomainEvent>::EVENT_TYPES,
                snapshot_interval: A::SNAPSHOT_INTERVAL,
            },
        );
        self
    }

    /// Override the snapshot interval of a kind (registering it if needed).
    #[must_use]
    pub fn snapshot_interval<A: Aggregate>(self, interval: u64) -> Self {
        let mut builder = self.register::<A>();
        builder.intervals.push((A::KIND, Some(interval)));
        builder
    }

    /// Disable snapshots for a kind (registering it if needed).
    #[must_use]
    pub fn without_snapshots<A: Aggregate>(self) -> Self {
        let mut builder = self.register::<A>();
        builder.intervals.push((A::KIND, None));
        builder
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateEventType`] if two kinds share a tag
    /// - [`RegistryError::ZeroInterval`] if an interval of zero was configured
    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut kinds = self.kinds;
        for (kind, interval) in self.intervals {
            if interval == Some(0) {
                return Err(RegistryError::ZeroInterval(kind.to_string()));
            }
            if let Some(entry) = kinds.get_mut(kind) {
                entry.snapshot_interval = interval;
            }
        }
        for (kind, entry) in &kinds {
            if entry.snapshot_interval == Some(0) {
                return Err(RegistryError::ZeroInterval((*kind).to_string()));
            }
        }

        let mut owners: BTreeMap<&'static str, &'static str> = BTreeMap::new();
        for (kind, entry) in &kinds {
            for event_type in entry.event_types {
                if let Some(first) = owners.insert(*event_type, *kind) {
                    return Err(RegistryError::DuplicateEventType {
                        event_type: (*event_type).to_string(),
                        first: first.to_string(),
                        second: (*kind).to_string(),
                    });
                }
            }
        }

        Ok(Registry { kinds })
    }
}
