//! The `Player` aggregate.

use rehydrate_core::aggregate::{Aggregate, MutationError, NaturalKey};
use rehydrate_core::event::DomainEvent;
use rehydrate_core::stream::AggregateId;
use serde::{Deserialize, Serialize};

/// A registered player and their running score.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Name as registered.
    pub name: String,
    /// Sum of every score added.
    pub score: u64,
}

/// Events of the [`Player`] aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerEvent {
    /// The player joined.
    Registered {
        /// Player name.
        name: String,
    },
    /// The player scored.
    ScoreAdded {
        /// Points scored.
        points: u64,
    },
}

impl DomainEvent for PlayerEvent {
    const EVENT_TYPES: &'static [&'static str] = &["Player.Registered", "Player.ScoreAdded"];

    fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "Player.Registered",
            Self::ScoreAdded { .. } => "Player.ScoreAdded",
        }
    }
}

impl Aggregate for Player {
    const KIND: &'static str = "player";
    const SNAPSHOT_INTERVAL: Option<u64> = Some(10);
    type Event = PlayerEvent;

    fn mutate(state: Option<Self>, event: &PlayerEvent) -> Result<Self, MutationError> {
        match (state, event) {
            (None, PlayerEvent::Registered { name }) => Ok(Self {
                name: name.clone(),
                score: 0,
            }),
            (Some(player), PlayerEvent::ScoreAdded { points }) => Ok(Self {
                score: player.score.saturating_add(*points),
                ..player
            }),
            (Some(_), e @ PlayerEvent::Registered { .. }) => Err(MutationError::AlreadyCreated {
                event_type: e.event_type(),
            }),
            (None, e @ PlayerEvent::ScoreAdded { .. }) => Err(MutationError::NotCreated {
                event_type: e.event_type(),
            }),
        }
    }
}

/// Names are case-insensitive: `john` and `JOHN` are the same player.
impl NaturalKey for Player {
    fn reference_for(key: &str) -> AggregateId {
        AggregateId::from_natural_key("player", &key.to_uppercase())
    }
}
