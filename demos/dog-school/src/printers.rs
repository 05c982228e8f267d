//! A follower that only logs what it sees.

use crate::counters::{Counter, CounterEvent};
use crate::domain::{Dog, DogEvent};
use rehydrate_core::aggregate::Aggregate;
use rehydrate_core::event::StoredEvent;
use rehydrate_core::event_store::EventStore;
use rehydrate_runtime::{
    Application, FollowerConfig, FollowerHandle, Policy, PolicyFuture, ProcessCoordinator, ProcessingUnit,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Logs dog and counter events. Writes no events, so its commits carry
/// tracking only.
#[derive(Debug, Default)]
pub struct PrintersPolicy {
    printed: AtomicUsize,
}

impl PrintersPolicy {
    /// Events logged so far, replays included.
    #[must_use]
    pub fn printed(&self) -> usize {
        self.printed.load(Ordering::Relaxed)
    }
}

impl Policy for PrintersPolicy {
    fn process<'a>(
        &'a self,
        upstream: &'a str,
        event: &'a StoredEvent,
        _unit: &'a mut ProcessingUnit,
    ) -> PolicyFuture<'a> {
        Box::pin(async move {
            let position = event.position;
            if event.kind == Dog::KIND {
                match event.decode::<DogEvent>()? {
                    DogEvent::Registered { name } => {
                        tracing::info!(upstream, %position, dog = %name, "Dog registered");
                    }
                    DogEvent::TrickAdded { trick } => {
                        tracing::info!(upstream, %position, reference = %event.reference, %trick, "Trick added");
                    }
                }
            } else if event.kind == Counter::KIND {
                match event.decode::<CounterEvent>()? {
                    CounterEvent::Started { name } => {
                        tracing::info!(upstream, %position, %name, "Counter started");
                    }
                    CounterEvent::Incremented => {
                        tracing::info!(upstream, %position, counter = %event.reference, version = %event.version, "Counter incremented");
                    }
                }
            } else {
                tracing::info!(upstream, %position, kind = %event.kind, event_type = %event.event_type, "Event");
            }
            self.printed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}

/// The printers application: no aggregates, only a tracking cursor.
#[derive(Clone)]
pub struct Printers {
    app: Application,
    policy: Arc<PrintersPolicy>,
}

impl Printers {
    /// Application and follower name.
    pub const NAME: &'static str = "printers";

    /// Create the application on an event store.
    #[must_use]
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self {
            app: Application::builder(Self::NAME, events).build(),
            policy: Arc::new(PrintersPolicy::default()),
        }
    }

    /// The underlying application.
    #[must_use]
    pub const fn application(&self) -> &Application {
        &self.app
    }

    /// Events logged so far.
    #[must_use]
    pub fn printed(&self) -> usize {
        self.policy.printed()
    }

    /// A coordinator that runs the shared [`PrintersPolicy`].
    #[must_use]
    pub fn coordinator(&self, config: FollowerConfig) -> (ProcessCoordinator, FollowerHandle) {
        let policy: Arc<dyn Policy> = self.policy.clone();
        ProcessCoordinator::new(Self::NAME, self.app.clone(), policy, config)
    }
}
