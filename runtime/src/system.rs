//! Explicit wiring of applications and followers.
//!
//! A [`System`] owns the applications of a deployment and the coordinators
//! that follow them. It runs in one of two modes:
//!
//! - [`System::run_until_idle`]: single-threaded, every follower in
//!   declaration order, repeated until a full pass makes no progress
//! - [`System::start`]: one tokio task per follower, stopped with
//!   [`RunningSystem::stop`]
//!
//! # Example
//!
//! ```ignore
//! let mut system = System::builder()
//!     .application(school.clone())
//!     .application(counters_app.clone())
//!     .follower(counters)
//!     .build()?;
//!
//! school.register_dog("Fido").await?;
//! system.run_until_idle().await?;
//! ```

use crate::application::Application;
use crate::coordinator::{FollowerError, FollowerHandle, ProcessCoordinator};
use crate::health::{HealthCheck, HealthReport};
use rehydrate_core::Utc;
use std::collections::HashSet;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors from building or running a [`System`].
#[derive(Error, Debug)]
pub enum SystemError {
    /// Two applications or two followers share a name.
    #[error("Duplicate name in system: {0}")]
    DuplicateName(String),

    /// A follower failed.
    #[error(transparent)]
    Follower(#[from] FollowerError),

    /// A follower task panicked or was cancelled.
    #[error("Follower task {name} did not finish: {message}")]
    Join {
        /// Follower name.
        name: String,
        /// Join error message.
        message: String,
    },
}

/// Builder for [`System`].
#[derive(Default)]
pub struct SystemBuilder {
    applications: Vec<Application>,
    followers: Vec<ProcessCoordinator>,
}

impl SystemBuilder {
    /// Add an application.
    #[must_use]
    pub fn application(mut self, application: Application) -> Self {
        self.applications.push(application);
        self
    }

    /// Add a follower. Followers run in the order they are added.
    #[must_use]
    pub fn follower(mut self, follower: ProcessCoordinator) -> Self {
        self.followers.push(follower);
        self
    }

    /// Build the system.
    ///
    /// # Errors
    ///
    /// [`SystemError::DuplicateName`] if two applications or two followers
    /// share a name.
    pub fn build(self) -> Result<System, SystemError> {
        let mut names = HashSet::new();
        for app in &self.applications {
            if !names.insert(app.name().to_string()) {
                return Err(SystemError::DuplicateName(app.name().to_string()));
            }
        }
        let mut followers = HashSet::new();
        for follower in &self.followers {
            if !followers.insert(follower.name().to_string()) {
                return Err(SystemError::DuplicateName(follower.name().to_string()));
            }
        }

        let handles = self.followers.iter().map(ProcessCoordinator::handle).collect();
        Ok(System {
            applications: self.applications,
            followers: self.followers,
            handles,
        })
    }
}

/// Applications and followers of one deployment.
pub struct System {
    applications: Vec<Application>,
    followers: Vec<ProcessCoordinator>,
    handles: Vec<FollowerHandle>,
}

impl System {
    /// Start building a system.
    #[must_use]
    pub fn builder() -> SystemBuilder {
        SystemBuilder::default()
    }

    /// Look up an application by name.
    #[must_use]
    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.name() == name)
    }

    /// Handle of a follower.
    #[must_use]
    pub fn follower(&self, name: &str) -> Option<&FollowerHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    /// Drive every follower until none has anything left to process.
    ///
    /// A follower's commits can feed a later follower, and a later
    /// follower's commits an earlier one, so passes repeat until one
    /// commits nothing. Returns the number of notifications processed.
    ///
    /// # Errors
    ///
    /// The first follower error stops the run.
    pub async fn run_until_idle(&mut self) -> Result<usize, SystemError> {
        let mut total = 0;
        loop {
            let mut pass = 0;
            for follower in &mut self.followers {
                pass += follower.run_until_idle().await?;
            }
            if pass == 0 {
                tracing::debug!(notifications = total, "System idle");
                return Ok(total);
            }
            total += pass;
        }
    }

    /// Spawn each follower on its own task.
    #[must_use]
    pub fn start(self) -> RunningSystem {
        tracing::info!(
            applications = self.applications.len(),
            followers = self.followers.len(),
            "Starting system"
        );
        let tasks = self
            .followers
            .into_iter()
            .map(|f| (f.name().to_string(), f.spawn()))
            .collect();
        RunningSystem {
            applications: self.applications,
            handles: self.handles,
            tasks,
            stopping: false,
        }
    }
}

/// A system whose followers run on tokio tasks.
pub struct RunningSystem {
    applications: Vec<Application>,
    handles: Vec<FollowerHandle>,
    tasks: Vec<(String, JoinHandle<Result<(), FollowerError>>)>,
    stopping: bool,
}

impl RunningSystem {
    /// Look up an application by name.
    #[must_use]
    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.name() == name)
    }

    /// Handle of a follower.
    #[must_use]
    pub fn follower(&self, name: &str) -> Option<&FollowerHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    /// Health of every follower.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let checks = self
            .handles
            .iter()
            .map(|h| HealthCheck::follower(h, self.stopping))
            .collect();
        HealthReport::new(checks, Utc::now())
    }

    /// Stop every follower and wait for their tasks.
    ///
    /// Each follower finishes its in-flight cycle first.
    ///
    /// # Errors
    ///
    /// Returns the first follower error, after every task has finished.
    pub async fn stop(mut self) -> Result<(), SystemError> {
        self.stopping = true;
        for handle in &self.handles {
            handle.stop();
        }

        let mut first_error = None;
        for (name, task) in self.tasks.drain(..) {
            let result = match task.await {
                Ok(result) => result.map_err(SystemError::from),
                Err(e) => Err(SystemError::Join {
                    name: name.clone(),
                    message: e.to_string(),
                }),
            };
            if let Err(e) = result {
                tracing::error!(follower = %name, error = %e, "Follower ended with an error");
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("System stopped");
        first_error.map_or(Ok(()), Err)
    }
}
