//! Dog school: an event-sourced application with two followers.
//!
//! - [`DogSchool`] registers dogs and teaches them tricks
//! - [`Counters`] follows it and counts dog names and trick names
//! - [`Printers`] follows both and logs every event
//!
//! Run in one task with [`DogSchoolSystem::run_until_idle`], or with a task
//! per follower via [`DogSchoolSystem::start`].

pub mod counters;
pub mod domain;
pub mod persistence;
pub mod printers;
pub mod school;
pub mod system;

pub use counters::{Counter, CounterEvent, Counters, CountersPolicy};
pub use domain::{Dog, DogError, DogEvent, DogView};
pub use persistence::{Persistence, PersistenceError, Stores};
pub use printers::{Printers, PrintersPolicy};
pub use school::{DogSchool, DogSchoolBuilder, SchoolError};
pub use system::{DogSchoolSystem, RunningDogSchool, SetupError};
