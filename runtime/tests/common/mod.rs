//! Fixtures shared by the runtime integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use rehydrate_core::aggregate::{Aggregate, MutationError, NaturalKey};
use rehydrate_core::event::{DomainEvent, StoredEvent};
use rehydrate_core::registry::Registry;
use rehydrate_core::stream::AggregateId;
use rehydrate_runtime::{Application, Policy, PolicyError, PolicyFuture, ProcessingUnit};
use rehydrate_testing::{InMemoryEventStore, InMemorySnapshotStore, test_clock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dog {
    pub name: String,
    pub tricks: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DogEvent {
    Registered { name: String },
    TrickAdded { trick: String },
}

impl DogEvent {
    pub fn registered(name: &str) -> Self {
        Self::Registered { name: name.to_string() }
    }

    pub fn trick(trick: &str) -> Self {
        Self::TrickAdded { trick: trick.to_string() }
    }
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
    const SNAPSHOT_INTERVAL: Option<u64> = Some(2);
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
            (None, e) => Err(MutationError::NotCreated {
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

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub key: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterEvent {
    Started { key: String },
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
            (None, CounterEvent::Started { key }) => Ok(Self {
                key: key.clone(),
                count: 0,
            }),
            (Some(counter), CounterEvent::Incremented) => Ok(Self {
                count: counter.count + 1,
                ..counter
            }),
            (Some(_), e @ CounterEvent::Started { .. }) => Err(MutationError::AlreadyCreated {
                event_type: e.event_type(),
            }),
            (None, e) => Err(MutationError::NotCreated {
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

/// Counts tricks; fails on every trick named in `refuse`.
#[derive(Default)]
pub struct TrickCounter {
    pub refuse: Vec<String>,
}

impl TrickCounter {
    pub fn refusing(trick: &str) -> Self {
        Self {
            refuse: vec![trick.to_string()],
        }
    }
}

impl Policy for TrickCounter {
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
                DogEvent::TrickAdded { trick } => {
                    if self.refuse.contains(&trick) {
                        return Err(PolicyError::Failed(format!("refusing {trick}")));
                    }
                    let now = unit.now();
                    let started = CounterEvent::Started { key: trick.clone() };
                    let counter = unit
                        .get_or_create::<Counter, _>(Counter::reference_for(&trick), || started)
                        .await?;
                    counter.trigger(CounterEvent::Incremented, now)?;
                    Ok(())
                }
                DogEvent::Registered { .. } => Ok(()),
            }
        })
    }
}

pub struct Deployment {
    pub school_store: InMemoryEventStore,
    pub counters_store: InMemoryEventStore,
    pub snapshots: InMemorySnapshotStore,
    pub school: Application,
    pub counters: Application,
}

pub fn dog_registry() -> Registry {
    Registry::builder().register::<Dog>().build().unwrap()
}

pub fn counter_registry() -> Registry {
    Registry::builder().register::<Counter>().build().unwrap()
}

pub fn deployment() -> Deployment {
    let school_store = InMemoryEventStore::new();
    let counters_store = InMemoryEventStore::new();
    let snapshots = InMemorySnapshotStore::new();

    let school = Application::builder("dog_school", Arc::new(school_store.clone()))
        .snapshots(Arc::new(snapshots.clone()))
        .registry(dog_registry())
        .clock(Arc::new(test_clock()))
        .build();
    let counters = Application::builder("counters", Arc::new(counters_store.clone()))
        .registry(counter_registry())
        .clock(Arc::new(test_clock()))
        .build();

    Deployment {
        school_store,
        counters_store,
        snapshots,
        school,
        counters,
    }
}

pub async fn add_tricks(app: &Application, name: &str, tricks: &[&str]) {
    let repository = app.repository::<Dog>();
    let mut dog = repository
        .create_or_get(name, || DogEvent::registered(name))
        .await
        .unwrap();
    let now = app.clock().now();
    for trick in tricks {
        dog.trigger(DogEvent::trick(trick), now).unwrap();
    }
    repository.save(&mut dog).await.unwrap();
}

pub async fn count(app: &Application, key: &str) -> u64 {
    match app.repository::<Counter>().get_by_key(key).await {
        Ok(counter) => counter.state().count,
        Err(_) => 0,
    }
}
