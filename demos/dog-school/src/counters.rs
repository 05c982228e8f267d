//! The `Counters` follower: how many dogs carry a name, how many know a trick.

use crate::domain::{Dog, DogEvent};
use rehydrate_core::aggregate::{Aggregate, MutationError, NaturalKey};
use rehydrate_core::event::{DomainEvent, StoredEvent};
use rehydrate_core::event_store::EventStore;
use rehydrate_core::registry::{Registry, RegistryError};
use rehydrate_core::stream::AggregateId;
use rehydrate_runtime::{
    Application, FollowerConfig, FollowerHandle, Policy, PolicyError, PolicyFuture,
    ProcessCoordinator, ProcessingUnit, RepositoryError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A named tally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Dog name or trick name.
    pub name: String,
    /// Times seen.
    pub count: u64,
}

/// Events of the [`Counter`] aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterEvent {
    /// First time the name was seen.
    Started {
        /// Dog name or trick name.
        name: String,
    },
    /// Seen once more.
    Incremented,
}

impl DomainEvent for CounterEvent {
    const EVENT_TYPES: &'static [&'static str] = &["Counter.Started", "Counter.Incremented"];

    fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "Counter.Started",
            Self::Incremented => "Counter.Incremented",
        }
    }
}

impl Aggregate for Counter {
    const KIND: &'static str = "counter";
    type Event = CounterEvent;

    fn mutate(state: Option<Self>, event: &CounterEvent) -> Result<Self, MutationError> {
        match (state, event) {
            (None, CounterEvent::Started { name }) => Ok(Self {
                name: name.clone(),
                count: 0,
            }),
            (Some(counter), CounterEvent::Incremented) => Ok(Self {
                count: counter.count + 1,
                ..counter
            }),
            (Some(_), e @ CounterEvent::Started { .. }) => Err(MutationError::AlreadyCreated {
                event_type: e.event_type(),
            }),
            (None, e @ CounterEvent::Incremented) => Err(MutationError::NotCreated {
                event_type: e.event_type(),
            }),
        }
    }
}

impl NaturalKey for Counter {
    fn reference_for(key: &str) -> AggregateId {
        AggregateId::from_natural_key("counters", key)
    }
}

/// Counts every registration by dog name and every trick by trick name.
#[derive(Debug, Default)]
pub struct CountersPolicy;

impl CountersPolicy {
    async fn bump(unit: &mut ProcessingUnit, name: &str) -> Result<(), PolicyError> {
        let now = unit.now();
        let counter = unit
            .get_or_create::<Counter, _>(Counter::reference_for(name), || CounterEvent::Started {
                name: name.to_string(),
            })
            .await?;
        counter.trigger(CounterEvent::Incremented, now)?;
        Ok(())
    }
}

impl Policy for CountersPolicy {
    fn process<'a>(
        &'a self,
        _upstream: &'a str,
        event: &'a StoredEvent,
        unit: &'a mut ProcessingUnit,
    ) -> PolicyFuture<'a> {
        Box::pin(async move {
            if event.kind != Dog::KIND {
                return Ok(());
            }
            match event.decode::<DogEvent>()? {
                DogEvent::Registered { name } => Self::bump(unit, &name).await,
                DogEvent::TrickAdded { trick } => Self::bump(unit, &trick).await,
            }
        })
    }
}

/// The counters process application.
#[derive(Clone)]
pub struct Counters {
    app: Application,
}

impl Counters {
    /// Application and follower name.
    pub const NAME: &'static str = "counters";

    /// Create the application on an event store.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the registry cannot be built.
    pub fn new(events: Arc<dyn EventStore>) -> Result<Self, RegistryError> {
        let registry = Registry::builder().register::<Counter>().build()?;
        Ok(Self {
            app: Application::builder(Self::NAME, events).registry(registry).build(),
        })
    }

    /// The underlying application.
    #[must_use]
    pub const fn application(&self) -> &Application {
        &self.app
    }

    /// A coordinator that runs [`CountersPolicy`] into this application.
    /// Attach upstreams with [`ProcessCoordinator::follow`].
    #[must_use]
    pub fn coordinator(&self, config: FollowerConfig) -> (ProcessCoordinator, FollowerHandle) {
        ProcessCoordinator::new(Self::NAME, self.app.clone(), Arc::new(CountersPolicy), config)
    }

    /// How many times `name` has been seen; 0 if never.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if storage fails.
    pub async fn get_count(&self, name: &str) -> Result<u64, RepositoryError> {
        match self.app.repository::<Counter>().get_by_key(name).await {
            Ok(counter) => Ok(counter.state().count),
            Err(RepositoryError::AggregateNotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }
}
