//! Aggregate trait and the aggregate root handle.
//!
//! An aggregate's state is a plain value. [`Aggregate::mutate`] is the
//! mutation engine: a pure, total function from `(previous value, event)` to
//! the next value. The same function runs when a command triggers a new event
//! and when history is replayed, so both paths always agree.
//!
//! [`AggregateRoot`] is the thin handle that pairs the value with its
//! reference, version and not-yet-committed events.

use crate::event::{DomainEvent, EventError, NewEvent};
use crate::snapshot::Snapshot;
use crate::stream::{AggregateId, Version};
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error returned by [`Aggregate::mutate`].
///
/// Both variants are programming errors (an event applied out of lifecycle
/// order). They are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// A non-creation event was applied to an aggregate that does not exist.
    #[error("{event_type} requires an existing aggregate")]
    NotCreated {
        /// Tag of the offending event.
        event_type: &'static str,
    },

    /// A creation event was applied to an aggregate that already exists.
    #[error("{event_type} cannot be applied to an existing aggregate")]
    AlreadyCreated {
        /// Tag of the offending event.
        event_type: &'static str,
    },
}

/// Error returned when a command triggers an event on an [`AggregateRoot`].
#[derive(Error, Debug)]
pub enum AggregateError {
    /// The mutation engine rejected the event.
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// The event could not be serialized for storage.
    #[error(transparent)]
    Event(#[from] EventError),
}

/// A domain aggregate whose state is derived from its event history.
///
/// # Contract
///
/// - [`mutate`](Aggregate::mutate) must be pure: no I/O, no clock, no randomness.
/// - It receives the previous value by ownership and returns the next one.
///   Collections inside the state are moved or rebuilt, never shared, so two
///   replays can never observe each other.
/// - `state == None` only for the creation event.
///
/// # Example
///
/// ```
/// use rehydrate_core::aggregate::{Aggregate, MutationError};
/// use rehydrate_core::event::DomainEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct Counter { name: String, count: u64 }
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// enum CounterEvent { Started { name: String }, Incremented }
///
/// impl DomainEvent for CounterEvent {
///     const EVENT_TYPES: &'static [&'static str] = &["Counter.Started", "Counter.Incremented"];
///     fn event_type(&self) -> &'static str {
///         match self {
///             Self::Started { .. } => "Counter.Started",
///             Self::Incremented => "Counter.Incremented",
///         }
///     }
/// }
///
/// impl Aggregate for Counter {
///     const KIND: &'static str = "counter";
///     type Event = CounterEvent;
///
///     fn mutate(state: Option<Self>, event: &CounterEvent) -> Result<Self, MutationError> {
///         match (state, event) {
///             (None, CounterEvent::Started { name }) => Ok(Counter { name: name.clone(), count: 0 }),
///             (Some(c), CounterEvent::Incremented) => Ok(Counter { count: c.count + 1, ..c }),
///             (Some(_), e @ CounterEvent::Started { .. }) => {
///                 Err(MutationError::AlreadyCreated { event_type: e.event_type() })
///             }
///             (None, e) => Err(MutationError::NotCreated { event_type: e.event_type() }),
///         }
///     }
/// }
/// ```
pub trait Aggregate: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies this aggregate kind (e.g. `"dog"`).
    const KIND: &'static str;

    /// Default snapshot interval for this kind. `None` disables snapshots
    /// unless the registry configures one.
    const SNAPSHOT_INTERVAL: Option<u64> = None;

    /// Schema version of the value as written into snapshots.
    ///
    /// Bump it whenever the value's fields change and teach
    /// [`upcast_state`](Aggregate::upcast_state) the previous layout.
    const SCHEMA_VERSION: u32 = 1;

    /// The event family this aggregate produces and folds.
    type Event: DomainEvent;

    /// Fold one event into the previous value.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError`] when the event does not fit the aggregate's
    /// lifecycle (creation applied twice, mutation before creation).
    fn mutate(state: Option<Self>, event: &Self::Event) -> Result<Self, MutationError>;

    /// Rewrite a snapshotted value stored under schema `from` into the layout
    /// of schema `from + 1`.
    ///
    /// Restoring calls it once per step until the value reaches
    /// [`SCHEMA_VERSION`](Aggregate::SCHEMA_VERSION). The default knows no
    /// older layouts, which makes the repository ignore the snapshot and
    /// replay the stream instead.
    ///
    /// # Errors
    ///
    /// Returns `EventError::UnsupportedSchema` if the step is unknown, or
    /// `EventError::DeserializationError` if the old value does not decode.
    fn upcast_state(from: u32, _state: Vec<u8>) -> Result<Vec<u8>, EventError> {
        Err(EventError::UnsupportedSchema {
            event_type: Self::KIND.to_string(),
            found: from,
            current: Self::SCHEMA_VERSION,
        })
    }
}

/// An aggregate whose reference is derived from a natural key.
///
/// Deriving the reference instead of generating it makes "create if absent"
/// idempotent: every caller registering `"Fido"` targets the same stream.
pub trait NaturalKey: Aggregate {
    /// The reference of the aggregate identified by `key`.
    fn reference_for(key: &str) -> AggregateId;
}

/// Fold a sequence of domain events into a value, starting from `state`.
///
/// This is the mutation engine without any storage concerns. Replaying the
/// full history from `None` equals replaying the tail from any intermediate
/// value.
///
/// # Errors
///
/// Returns the first [`MutationError`] raised by [`Aggregate::mutate`].
pub fn project<'a, A, I>(state: Option<A>, events: I) -> Result<Option<A>, MutationError>
where
    A: Aggregate,
    I: IntoIterator<Item = &'a A::Event>,
{
    events
        .into_iter()
        .try_fold(state, |state, event| A::mutate(state, event).map(Some))
}

/// Handle over one aggregate: reference, version, value and pending events.
///
/// Each command works on its own root, freshly loaded from storage. The root
/// is never shared between tasks.
#[derive(Clone, Debug)]
pub struct AggregateRoot<A> {
    reference: AggregateId,
    version: Version,
    state: A,
    created_on: DateTime<Utc>,
    modified_on: DateTime<Utc>,
    pending: Vec<NewEvent>,
}

/// Snapshot body. The value is encoded on its own so it can be upcast
/// without touching the header.
#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    reference: AggregateId,
    version: Version,
    created_on: DateTime<Utc>,
    modified_on: DateTime<Utc>,
    state: Vec<u8>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Create a new aggregate from its creation event.
    ///
    /// The root is at version 1 with the creation event pending.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if the event is not a creation event or
    /// cannot be serialized.
    pub fn create(
        reference: AggregateId,
        event: A::Event,
        now: DateTime<Utc>,
    ) -> Result<Self, AggregateError> {
        let state = A::mutate(None, &event)?;
        let version = Version::INITIAL.next();
        let pending = vec![NewEvent::from_domain(A::KIND, &event, version, now)?];
        Ok(Self {
            reference,
            version,
            state,
            created_on: now,
            modified_on: now,
            pending,
        })
    }

    /// Apply a new event produced by a command.
    ///
    /// The value is replaced only if both the mutation and the serialization
    /// succeed, so a rejected event leaves the root unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if the mutation engine rejects the event or
    /// it cannot be serialized.
    pub fn trigger(&mut self, event: A::Event, now: DateTime<Utc>) -> Result<(), AggregateError> {
        let next_state = A::mutate(Some(self.state.clone()), &event)?;
        let next_version = self.version.next();
        let record = NewEvent::from_domain(A::KIND, &event, next_version, now)?;

        self.state = next_state;
        self.version = next_version;
        self.modified_on = now;
        self.pending.push(record);
        Ok(())
    }

    /// Rebuild a root from already committed parts (used by replay).
    pub(crate) const fn from_parts(
        reference: AggregateId,
        version: Version,
        state: A,
        created_on: DateTime<Utc>,
        modified_on: DateTime<Utc>,
    ) -> Self {
        Self {
            reference,
            version,
            state,
            created_on,
            modified_on,
            pending: Vec::new(),
        }
    }

    /// Fold one replayed event into a committed root.
    ///
    /// The value is moved into [`Aggregate::mutate`], never cloned.
    pub(crate) fn advance(
        self,
        version: Version,
        event: &A::Event,
        at: DateTime<Utc>,
    ) -> Result<Self, MutationError> {
        let Self {
            reference,
            state,
            created_on,
            pending,
            ..
        } = self;
        Ok(Self {
            reference,
            version,
            state: A::mutate(Some(state), event)?,
            created_on,
            modified_on: at,
            pending,
        })
    }

    /// The aggregate's reference.
    #[must_use]
    pub const fn reference(&self) -> AggregateId {
        self.reference
    }

    /// Current version, including pending events.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Version as last loaded or saved, before the pending events.
    #[must_use]
    pub fn committed_version(&self) -> Version {
        self.version - self.pending.len() as u64
    }

    /// The current value.
    #[must_use]
    pub const fn state(&self) -> &A {
        &self.state
    }

    /// Consume the root, keeping only the value.
    #[must_use]
    pub fn into_state(self) -> A {
        self.state
    }

    /// Timestamp of the creation event.
    #[must_use]
    pub const fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    /// Timestamp of the latest event.
    #[must_use]
    pub const fn modified_on(&self) -> DateTime<Utc> {
        self.modified_on
    }

    /// Events triggered since the last load or save.
    #[must_use]
    pub fn pending(&self) -> &[NewEvent] {
        &self.pending
    }

    /// Whether there is anything to save.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Forget the pending events after they were committed.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Move the pending events out of the root.
    ///
    /// The root's version still counts them, so it should be discarded or
    /// reloaded if the events are never committed.
    pub fn take_pending(&mut self) -> Vec<NewEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Serialize the committed root into a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the value cannot be serialized.
    pub fn to_snapshot(&self, now: DateTime<Utc>) -> Result<Snapshot, EventError> {
        let body = SnapshotBody {
            reference: self.reference,
            version: self.version,
            created_on: self.created_on,
            modified_on: self.modified_on,
            state: bincode::serialize(&self.state)
                .map_err(|e| EventError::SerializationError(e.to_string()))?,
        };
        let state =
            bincode::serialize(&body).map_err(|e| EventError::SerializationError(e.to_string()))?;
        Ok(Snapshot {
            reference: self.reference,
            kind: A::KIND.to_string(),
            version: self.version,
            schema_version: A::SCHEMA_VERSION,
            state,
            timestamp: now,
        })
    }

    /// Restore a root from a snapshot.
    ///
    /// # Errors
    ///
    /// - `EventError::DeserializationError` if the snapshot belongs to another
    ///   kind, another reference, or does not decode
    /// - `EventError::UnsupportedSchema` if the value is newer than `A`, or an
    ///   older schema has no upcaster
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, EventError> {
        if snapshot.kind != A::KIND {
            return Err(EventError::DeserializationError(format!(
                "snapshot of kind {} cannot restore {}",
                snapshot.kind,
                A::KIND
            )));
        }
        let found = snapshot.schema_version;
        if found == 0 || found > A::SCHEMA_VERSION {
            return Err(EventError::UnsupportedSchema {
                event_type: A::KIND.to_string(),
                found,
                current: A::SCHEMA_VERSION,
            });
        }
        let body: SnapshotBody = bincode::deserialize(&snapshot.state)
            .map_err(|e| EventError::DeserializationError(e.to_string()))?;
        if body.reference != snapshot.reference || body.version != snapshot.version {
            return Err(EventError::DeserializationError(format!(
                "snapshot header {}@{} does not match its state {}@{}",
                snapshot.reference, snapshot.version, body.reference, body.version
            )));
        }
        let bytes = (found..A::SCHEMA_VERSION)
            .try_fold(body.state, |bytes, from| A::upcast_state(from, bytes))?;
        let state: A =
            bincode::deserialize(&bytes).map_err(|e| EventError::DeserializationError(e.to_string()))?;
        Ok(Self {
            reference: body.reference,
            version: body.version,
            state,
            created_on: body.created_on,
            modified_on: body.modified_on,
            pending: Vec::new(),
        })
    }
}
