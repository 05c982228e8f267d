//! The `Dog` aggregate.

use rehydrate_core::aggregate::{Aggregate, AggregateError, AggregateRoot, MutationError, NaturalKey};
use rehydrate_core::event::DomainEvent;
use rehydrate_core::stream::AggregateId;
use rehydrate_core::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on the number of tricks one dog can learn.
pub const DEFAULT_MAX_TRICKS: usize = 20_000_000;

/// A dog and the tricks it has learned, in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dog {
    /// Name, also the natural key.
    pub name: String,
    /// Tricks in the order they were added.
    pub tricks: Vec<String>,
}

/// Events of the [`Dog`] aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DogEvent {
    /// The dog joined the school.
    Registered {
        /// Dog name.
        name: String,
    },
    /// The dog learned a trick.
    TrickAdded {
        /// Trick name.
        trick: String,
    },
}

impl DomainEvent for DogEvent {
    const EVENT_TYPES: &'static [&'static str] = &["Dog.Registered", "Dog.TrickAdded"];

    fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "Dog.Registered",
            Self::TrickAdded { .. } => "Dog.TrickAdded",
        }
    }
}

impl Aggregate for Dog {
    const KIND: &'static str = "dog";
    const SNAPSHOT_INTERVAL: Option<u64> = Some(100);
    type Event = DogEvent;

    fn mutate(state: Option<Self>, event: &DogEvent) -> Result<Self, MutationError> {
        match (state, event) {
            (None, DogEvent::Registered { name }) => Ok(Self {
                name: name.clone(),
                tricks: Vec::new(),
            }),
            (Some(dog), DogEvent::TrickAdded { trick }) => {
                let mut tricks = dog.tricks;
                tricks.push(trick.clone());
                Ok(Self { tricks, ..dog })
            }
            (Some(_), e @ DogEvent::Registered { .. }) => Err(MutationError::AlreadyCreated {
                event_type: e.event_type(),
            }),
            (None, e @ DogEvent::TrickAdded { .. }) => Err(MutationError::NotCreated {
                event_type: e.event_type(),
            }),
        }
    }
}

impl NaturalKey for Dog {
    fn reference_for(key: &str) -> AggregateId {
        AggregateId::from_natural_key("dogs", key)
    }
}

/// Domain rule violations.
#[derive(Error, Debug)]
pub enum DogError {
    /// The dog already knows as many tricks as allowed.
    #[error("{name} already knows {max} tricks")]
    TooManyTricks {
        /// Dog name.
        name: String,
        /// The cap.
        max: usize,
    },

    /// The event could not be applied.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// Teach a dog a trick, unless it already knows `max_tricks` of them.
///
/// # Errors
///
/// - [`DogError::TooManyTricks`] when the cap is reached
/// - [`DogError::Aggregate`] if the event cannot be applied
pub fn add_trick(
    dog: &mut AggregateRoot<Dog>,
    trick: &str,
    max_tricks: usize,
    now: DateTime<Utc>,
) -> Result<(), DogError> {
    if dog.state().tricks.len() >= max_tricks {
        return Err(DogError::TooManyTricks {
            name: dog.state().name.clone(),
            max: max_tricks,
        });
    }
    dog.trigger(
        DogEvent::TrickAdded {
            trick: trick.to_string(),
        },
        now,
    )?;
    Ok(())
}

/// What callers get back from `get_dog`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DogView {
    /// Dog name.
    pub name: String,
    /// Tricks in the order they were added.
    pub tricks: Vec<String>,
}

impl From<&Dog> for DogView {
    fn from(dog: &Dog) -> Self {
        Self {
            name: dog.name.clone(),
            tricks: dog.tricks.clone(),
        }
    }
}
