//! Domain events and their stored representations.
//!
//! Events are immutable facts about one aggregate. They travel through the
//! system in two shapes:
//!
//! - [`NewEvent`]: produced by an aggregate, versioned but not yet committed
//! - [`StoredEvent`]: committed, carrying its global notification [`Position`]
//!
//! Payloads are serialized with `bincode`. The `event_type` tag is stored next
//! to the payload so readers can reject an event they do not know before
//! trying to decode it.
//!
//! # Schema evolution
//!
//! Every record also carries the schema version its payload was written
//! with ([`DomainEvent::SCHEMA_VERSION`]). Stored events are immutable, so
//! when an event's shape changes the family bumps its version and implements
//! [`DomainEvent::upcast`] to rewrite old payloads one version at a time on
//! read. `bincode` is not self-describing: every change to a variant's
//! fields needs a version bump.
//!
//! # Example
//!
//! ```
//! use rehydrate_core::event::DomainEvent;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum DogEvent {
//!     Registered { name: String },
//!     TrickAdded { trick: String },
//! }
//!
//! impl DomainEvent for DogEvent {
//!     const EVENT_TYPES: &'static [&'static str] = &["Dog.Registered", "Dog.TrickAdded"];
//!
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             DogEvent::Registered { .. } => "Dog.Registered",
//!             DogEvent::TrickAdded { .. } => "Dog.TrickAdded",
//!         }
//!     }
//! }
//! ```

use crate::stream::{AggregateId, Position, Version};
use crate::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The stored type tag is not one this reader knows.
    ///
    /// This is a deployment or versioning mismatch, never a transient error.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The payload was written under a schema version this reader cannot
    /// bring up to date.
    #[error("Cannot read {event_type} written with schema {found}, current schema is {current}")]
    UnsupportedSchema {
        /// The stored type tag (or aggregate kind, for snapshots).
        event_type: String,
        /// Schema version of the stored payload.
        found: u32,
        /// Schema version this reader writes.
        current: u32,
    },
}

/// An event that can be committed to an event store and replayed.
///
/// Implementors are sum types (one enum variant per event kind) so that the
/// mutation logic can match exhaustively.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` to cross task boundaries.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Every type tag [`event_type`](DomainEvent::event_type) can return.
    const EVENT_TYPES: &'static [&'static str];

    /// Schema version written with every new event of this family.
    ///
    /// Bump it whenever a variant's fields change and teach
    /// [`upcast`](DomainEvent::upcast) the previous layout.
    const SCHEMA_VERSION: u32 = 1;

    /// Returns the stable type tag of this event.
    fn event_type(&self) -> &'static str;

    /// Rewrite a payload stored under schema `from` into the layout of
    /// schema `from + 1`.
    ///
    /// Decoding calls it once per step until the payload reaches
    /// [`SCHEMA_VERSION`](DomainEvent::SCHEMA_VERSION). Tags whose layout did
    /// not change in that step are returned as they are. The default knows
    /// no older layouts.
    ///
    /// # Errors
    ///
    /// Returns `EventError::UnsupportedSchema` if the step is unknown, or
    /// `EventError::DeserializationError` if the old payload does not decode.
    fn upcast(event_type: &str, from: u32, _data: Vec<u8>) -> Result<Vec<u8>, EventError> {
        Err(EventError::UnsupportedSchema {
            event_type: event_type.to_string(),
            found: from,
            current: Self::SCHEMA_VERSION,
        })
    }

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// were written by an incompatible schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }

    /// Whether `event_type` is one of this event family's tags.
    #[must_use]
    fn knows(event_type: &str) -> bool {
        Self::EVENT_TYPES.contains(&event_type)
    }
}

/// An event produced by an aggregate but not yet committed.
///
/// The version is assigned when the event is triggered on the aggregate, so a
/// batch of new events for one aggregate always carries contiguous versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEvent {
    /// Aggregate kind that produced this event (e.g. `"dog"`).
    pub kind: String,

    /// The event type tag (e.g. `"Dog.TrickAdded"`).
    pub event_type: String,

    /// The version this event gives its aggregate.
    pub version: Version,

    /// Schema version the payload was written with.
    pub schema_version: u32,

    /// The bincode-serialized payload.
    pub data: Vec<u8>,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    /// Serialize a domain event into a pending record.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be serialized.
    pub fn from_domain<E: DomainEvent>(
        kind: &str,
        event: &E,
        version: Version,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            kind: kind.to_string(),
            event_type: event.event_type().to_string(),
            version,
            schema_version: E::SCHEMA_VERSION,
            data: event.to_bytes()?,
            timestamp,
        })
    }

    /// Turn this pending event into a committed record.
    #[must_use]
    pub fn into_stored(self, reference: AggregateId, position: Position) -> StoredEvent {
        StoredEvent {
            reference,
            kind: self.kind,
            version: self.version,
            event_type: self.event_type,
            schema_version: self.schema_version,
            data: self.data,
            timestamp: self.timestamp,
            position,
        }
    }
}

/// A committed event as read back from an event store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEvent {
    /// The aggregate this event belongs to.
    pub reference: AggregateId,

    /// Aggregate kind (e.g. `"dog"`).
    pub kind: String,

    /// The version this event gave its aggregate.
    pub version: Version,

    /// The event type tag.
    pub event_type: String,

    /// Schema version the payload was written with.
    pub schema_version: u32,

    /// The bincode-serialized payload.
    pub data: Vec<u8>,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,

    /// Global notification position within the application.
    pub position: Position,
}

impl StoredEvent {
    /// Decode the payload into a concrete event family.
    ///
    /// # Errors
    ///
    /// - `EventError::UnknownEventType` if the tag is not in `E::EVENT_TYPES`
    /// - `EventError::UnsupportedSchema` if the payload is newer than `E`, or
    ///   an older schema has no upcaster
    /// - `EventError::DeserializationError` if the payload does not decode, or
    ///   decodes to a variant whose tag differs from the stored one
    pub fn decode<E: DomainEvent>(&self) -> Result<E, EventError> {
        if !E::knows(&self.event_type) {
            return Err(EventError::UnknownEventType(self.event_type.clone()));
        }
        let event = if self.schema_version == E::SCHEMA_VERSION {
            E::from_bytes(&self.data)?
        } else {
            E::from_bytes(&upcast_payload::<E>(
                &self.event_type,
                self.schema_version,
                self.data.clone(),
            )?)?
        };
        if event.event_type() != self.event_type {
            return Err(EventError::DeserializationError(format!(
                "payload decodes as {} but is tagged {}",
                event.event_type(),
                self.event_type
            )));
        }
        Ok(event)
    }
}

/// Bring a payload written under schema `found` up to `E::SCHEMA_VERSION`.
fn upcast_payload<E: DomainEvent>(event_type: &str, found: u32, data: Vec<u8>) -> Result<Vec<u8>, EventError> {
    if found == 0 || found > E::SCHEMA_VERSION {
        return Err(EventError::UnsupportedSchema {
            event_type: event_type.to_string(),
            found,
            current: E::SCHEMA_VERSION,
        });
    }
    (found..E::SCHEMA_VERSION).try_fold(data, |data, from| E::upcast(event_type, from, data))
}

impl fmt::Display for StoredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoredEvent {{ type: {} v{}, reference: {}, version: {}, position: {}, size: {} bytes }}",
            self.event_type,
            self.schema_version,
            self.reference,
            self.version,
            self.position,
            self.data.len()
        )
    }
}
