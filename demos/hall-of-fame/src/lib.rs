//! Hall of fame: players score points, a follower keeps the high scores.
//!
//! [`Game`] owns the [`Player`] aggregates. [`HallOfFame`] follows it and
//! folds every registration and score into one [`HighScoreTable`].

pub mod game;
pub mod hall_of_fame;
pub mod player;

pub use game::{Game, GameError};
pub use hall_of_fame::{Entry, HallOfFame, HallOfFamePolicy, HighScoreEvent, HighScoreTable};
pub use player::{Player, PlayerEvent};
