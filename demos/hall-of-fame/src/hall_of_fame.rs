//! The `HallOfFame` follower and its `HighScoreTable`.
//!
//! One table aggregate collects every player's score. Each recorded score
//! carries the player version it came from, and the table remembers the
//! last version folded per player. A score event delivered twice is then
//! ignored even if the tracking record were lost.

use crate::player::{Player, PlayerEvent};
use rehydrate_core::aggregate::{Aggregate, MutationError};
use rehydrate_core::event::{DomainEvent, StoredEvent};
use rehydrate_core::event_store::EventStore;
use rehydrate_core::registry::{Registry, RegistryError};
use rehydrate_core::snapshot::SnapshotStore;
use rehydrate_core::stream::{AggregateId, Version};
use rehydrate_runtime::{
    Application, FollowerConfig, FollowerHandle, Policy, PolicyFuture, ProcessCoordinator, ProcessingUnit,
    RepositoryError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// One row of the table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Player name.
    pub name: String,
    /// Total score.
    pub score: u64,
    /// Last player version folded into this row.
    pub seen: Version,
}

/// Scores of every player, keyed by player reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighScoreTable {
    /// Rows by player.
    pub entries: BTreeMap<AggregateId, Entry>,
}

impl HighScoreTable {
    /// The single table's reference.
    #[must_use]
    pub fn reference() -> AggregateId {
        AggregateId::new(Uuid::new_v5(&Uuid::NAMESPACE_URL, b"/high_score_table"))
    }

    /// Whether the player event at `version` is already in the table.
    #[must_use]
    pub fn has_folded(&self, player: AggregateId, version: Version) -> bool {
        self.entries.get(&player).is_some_and(|e| e.seen >= version)
    }

    /// The `n` best players, highest score first. Ties go by name.
    #[must_use]
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let mut rows: Vec<_> = self.entries.values().map(|e| (e.name.clone(), e.score)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(n);
        rows
    }
}

/// Events of the [`HighScoreTable`] aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HighScoreEvent {
    /// The table was created.
    Opened,
    /// A player joined the table.
    PlayerRegistered {
        /// Player reference.
        player: AggregateId,
        /// Player name.
        name: String,
    },
    /// A player's score went up.
    ScoreRecorded {
        /// Player reference.
        player: AggregateId,
        /// Points added.
        points: u64,
        /// Player version that added them.
        player_version: Version,
    },
}

impl DomainEvent for HighScoreEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "HighScoreTable.Opened",
        "HighScoreTable.PlayerRegistered",
        "HighScoreTable.ScoreRecorded",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened => "HighScoreTable.Opened",
            Self::PlayerRegistered { .. } => "HighScoreTable.PlayerRegistered",
            Self::ScoreRecorded { .. } => "HighScoreTable.ScoreRecorded",
        }
    }
}

impl Aggregate for HighScoreTable {
    const KIND: &'static str = "high_score_table";
    const SNAPSHOT_INTERVAL: Option<u64> = Some(100);
    type Event = HighScoreEvent;

    fn mutate(state: Option<Self>, event: &HighScoreEvent) -> Result<Self, MutationError> {
        match (state, event) {
            (None, HighScoreEvent::Opened) => Ok(Self::default()),
            (Some(mut table), HighScoreEvent::PlayerRegistered { player, name }) => {
                table.entries.insert(
                    *player,
                    Entry {
                        name: name.clone(),
                        score: 0,
                        seen: Version::new(1),
                    },
                );
                Ok(table)
            }
            (
                Some(mut table),
                HighScoreEvent::ScoreRecorded {
                    player,
                    points,
                    player_version,
                },
            ) => {
                let entry = table.entries.entry(*player).or_insert_with(|| Entry {
                    name: String::new(),
                    score: 0,
                    seen: Version::INITIAL,
                });
                entry.score = entry.score.saturating_add(*points);
                entry.seen = *player_version;
                Ok(table)
            }
            (Some(_), e @ HighScoreEvent::Opened) => Err(MutationError::AlreadyCreated {
                event_type: e.event_type(),
            }),
            (None, e) => Err(MutationError::NotCreated {
                event_type: e.event_type(),
            }),
        }
    }
}

/// Folds player events into the table.
#[derive(Debug, Default)]
pub struct HallOfFamePolicy;

impl Policy for HallOfFamePolicy {
    fn process<'a>(
        &'a self,
        _upstream: &'a str,
        event: &'a StoredEvent,
        unit: &'a mut ProcessingUnit,
    ) -> PolicyFuture<'a> {
        Box::pin(async move {
            if event.kind != Player::KIND {
                return Ok(());
            }
            let player_event = event.decode::<PlayerEvent>()?;
            let now = unit.now();
            let table = unit
                .get_or_create::<HighScoreTable, _>(HighScoreTable::reference(), || HighScoreEvent::Opened)
                .await?;

            if table.state().has_folded(event.reference, event.version) {
                tracing::debug!(player = %event.reference, version = %event.version, "Score already in table");
                return Ok(());
            }
            let update = match player_event {
                PlayerEvent::Registered { name } => HighScoreEvent::PlayerRegistered {
                    player: event.reference,
                    name,
                },
                PlayerEvent::ScoreAdded { points } => HighScoreEvent::ScoreRecorded {
                    player: event.reference,
                    points,
                    player_version: event.version,
                },
            };
            table.trigger(update, now)?;
            Ok(())
        })
    }
}

/// The hall of fame process application.
#[derive(Clone)]
pub struct HallOfFame {
    app: Application,
}

impl HallOfFame {
    /// Application and follower name.
    pub const NAME: &'static str = "hall_of_fame";

    /// Create the application.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the registry cannot be built.
    pub fn new(
        events: Arc<dyn EventStore>,
        snapshots: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self, RegistryError> {
        let registry = Registry::builder().register::<HighScoreTable>().build()?;
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

    /// A coordinator running [`HallOfFamePolicy`] into this application.
    #[must_use]
    pub fn coordinator(&self, config: FollowerConfig) -> (ProcessCoordinator, FollowerHandle) {
        ProcessCoordinator::new(Self::NAME, self.app.clone(), Arc::new(HallOfFamePolicy), config)
    }

    /// The `n` best players; empty before anyone registered.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if storage fails.
    pub async fn top(&self, n: usize) -> Result<Vec<(String, u64)>, RepositoryError> {
        match self.app.repository::<HighScoreTable>().get(HighScoreTable::reference()).await {
            Ok(table) => Ok(table.state().top(n)),
            Err(RepositoryError::AggregateNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
