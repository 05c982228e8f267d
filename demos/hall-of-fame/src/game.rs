//! The `Game` application.

use crate::player::{Player, PlayerEvent};
use rehydrate_core::aggregate::AggregateError;
use rehydrate_core::event_store::EventStore;
use rehydrate_core::registry::{Registry, RegistryError};
use rehydrate_core::snapshot::SnapshotStore;
use rehydrate_core::stream::AggregateId;
use rehydrate_runtime::{Application, RepositoryError};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`Game`].
#[derive(Error, Debug)]
pub enum GameError {
    /// Nobody registered under that reference.
    #[error("No player {0}")]
    PlayerNotFound(AggregateId),

    /// The event could not be applied.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Loading or saving failed.
    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for GameError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::AggregateNotFound(reference) => Self::PlayerNotFound(reference),
            other => Self::Repository(other),
        }
    }
}

/// Registers players and records their scores.
#[derive(Clone)]
pub struct Game {
    app: Application,
}

impl Game {
    /// Application name.
    pub const NAME: &'static str = "game";

    /// Create the game. Players are snapshotted every 10 versions when a
    /// snapshot store is given.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the registry cannot be built.
    pub fn new(
        events: Arc<dyn EventStore>,
        snapshots: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self, RegistryError> {
        let registry = Registry::builder().register::<Player>().build()?;
        let mut app = Application::builder(Self::NAME, events).registry(registry);
        if let Some(snapshots) = snapshots {
            app = app.snapshots(snapshots);
        }
        Ok(Self { app: app.build() })
    }

    /// The underlying application.
    #[must_use]
    pub const fn application(&self) -> &Application {
        &self.app
    }

    /// Register a player, or return the existing one with that name.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::Repository`] if storage fails.
    pub async fn register(&self, name: &str) -> Result<AggregateId, GameError> {
        let player = self
            .app
            .repository::<Player>()
            .create_or_get(name, || PlayerEvent::Registered {
                name: name.to_string(),
            })
            .await?;
        Ok(player.reference())
    }

    /// Add points to a player's score.
    ///
    /// # Errors
    ///
    /// - [`GameError::PlayerNotFound`] if nobody registered as `player`
    /// - [`GameError::Repository`] on conflict or storage failure
    pub async fn add_score(&self, player: AggregateId, points: u64) -> Result<(), GameError> {
        let repository = self.app.repository::<Player>();
        let mut root = repository.get(player).await?;
        root.trigger(PlayerEvent::ScoreAdded { points }, self.app.clock().now())?;
        repository.save(&mut root).await?;
        tracing::debug!(player = %root.state().name, points, score = root.state().score, "Score added");
        Ok(())
    }

    /// Current state of a player.
    ///
    /// # Errors
    ///
    /// - [`GameError::PlayerNotFound`] if nobody registered as `player`
    /// - [`GameError::Repository`] if storage fails
    pub async fn get(&self, player: AggregateId) -> Result<Player, GameError> {
        Ok(self.app.repository::<Player>().get(player).await?.into_state())
    }
}
