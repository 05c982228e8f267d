//! The dog school system: `DogSchool` feeding `Counters`, both feeding `Printers`.
//!
//! ```text
//! dog_school ──► counters
//!     │             │
//!     └──► printers ◄┘
//! ```

use crate::counters::Counters;
use crate::persistence::{Persistence, PersistenceError};
use crate::printers::Printers;
use crate::school::DogSchool;
use rehydrate_core::registry::RegistryError;
use rehydrate_runtime::{FollowerConfig, HealthReport, RunningSystem, System, SystemError};
use thiserror::Error;

/// Errors assembling the system.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Stores could not be opened.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// An application registry is invalid.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The system could not be built.
    #[error(transparent)]
    System(#[from] SystemError),
}

/// The three applications, with followers ready to run.
pub struct DogSchoolSystem {
    school: DogSchool,
    counters: Counters,
    printers: Printers,
    system: System,
}

impl DogSchoolSystem {
    /// Open every application's stores and wire the followers.
    ///
    /// # Errors
    ///
    /// See [`SetupError`].
    pub async fn open(persistence: &Persistence, config: FollowerConfig) -> Result<Self, SetupError> {
        let school_stores = persistence.stores(DogSchool::NAME).await?;
        let school = DogSchool::builder(school_stores.events)
            .snapshots(school_stores.snapshots)
            .build()?;

        let counters_stores = persistence.stores(Counters::NAME).await?;
        let counters = Counters::new(counters_stores.events)?;

        let printers_stores = persistence.stores(Printers::NAME).await?;
        let printers = Printers::new(printers_stores.events);

        let (mut counting, _) = counters.coordinator(config.clone());
        counting.follow(school.application().clone());
        let counting = counting.with_dead_letters(persistence.dead_letters());

        let (mut printing, _) = printers.coordinator(config);
        printing
            .follow(school.application().clone())
            .follow(counters.application().clone());
        let printing = printing.with_dead_letters(persistence.dead_letters());

        let system = System::builder()
            .application(school.application().clone())
            .application(counters.application().clone())
            .application(printers.application().clone())
            .follower(counting)
            .follower(printing)
            .build()?;

        Ok(Self {
            school,
            counters,
            printers,
            system,
        })
    }

    /// The dog school application.
    #[must_use]
    pub const fn school(&self) -> &DogSchool {
        &self.school
    }

    /// The counters application.
    #[must_use]
    pub const fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The printers application.
    #[must_use]
    pub const fn printers(&self) -> &Printers {
        &self.printers
    }

    /// Process everything pending on the calling task.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError`] if a follower fails.
    pub async fn run_until_idle(&mut self) -> Result<usize, SystemError> {
        self.system.run_until_idle().await
    }

    /// Run the followers on their own tasks.
    #[must_use]
    pub fn start(self) -> RunningDogSchool {
        RunningDogSchool {
            school: self.school,
            counters: self.counters,
            printers: self.printers,
            running: self.system.start(),
        }
    }
}

/// A [`DogSchoolSystem`] whose followers run in the background.
pub struct RunningDogSchool {
    school: DogSchool,
    counters: Counters,
    printers: Printers,
    running: RunningSystem,
}

impl RunningDogSchool {
    /// The dog school application.
    #[must_use]
    pub const fn school(&self) -> &DogSchool {
        &self.school
    }

    /// The counters application.
    #[must_use]
    pub const fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The printers application.
    #[must_use]
    pub const fn printers(&self) -> &Printers {
        &self.printers
    }

    /// Follower health.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.running.health()
    }

    /// Stop the followers.
    ///
    /// # Errors
    ///
    /// Returns the first follower error.
    pub async fn stop(self) -> Result<(), SystemError> {
        self.running.stop().await
    }
}
