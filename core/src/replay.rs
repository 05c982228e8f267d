//! Rebuilding aggregate roots from stored events.
//!
//! [`fold`] is the replay path of the mutation engine: it decodes each stored
//! event, checks that it belongs to the aggregate and continues its version
//! sequence, and applies [`Aggregate::mutate`].

use crate::aggregate::{Aggregate, AggregateRoot, MutationError};
use crate::event::{EventError, StoredEvent};
use crate::stream::{AggregateId, Version};
use thiserror::Error;

/// Errors raised while replaying a stream.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Versions in the stream are not contiguous.
    #[error("Version gap in {reference}: expected {expected}, found {found}")]
    VersionGap {
        /// The aggregate being replayed.
        reference: AggregateId,
        /// The version the next event should carry.
        expected: Version,
        /// The version it actually carries.
        found: Version,
    },

    /// An event of another aggregate was handed to the fold.
    #[error("Event for {found} found while replaying {expected}")]
    WrongReference {
        /// The aggregate being replayed.
        expected: AggregateId,
        /// The reference on the stray event.
        found: AggregateId,
    },

    /// An event could not be decoded.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The mutation engine rejected a stored event.
    #[error(transparent)]
    Mutation(#[from] MutationError),
}

/// Fold stored events onto an optional seed root.
///
/// `seed` is the root restored from a snapshot, or `None` to replay from the
/// beginning. Events must follow the seed's version without gaps. Returns
/// `None` only when there is no seed and no events.
///
/// # Errors
///
/// Returns [`ReplayError`] on a version gap, a stray event, an unknown or
/// corrupt payload, or an event the mutation engine rejects.
pub fn fold<A: Aggregate>(
    reference: AggregateId,
    seed: Option<AggregateRoot<A>>,
    events: &[StoredEvent],
) -> Result<Option<AggregateRoot<A>>, ReplayError> {
    events.iter().try_fold(seed, |root, stored| {
        if stored.reference != reference {
            return Err(ReplayError::WrongReference {
                expected: reference,
                found: stored.reference,
            });
        }

        let expected = root.as_ref().map_or(Version::INITIAL, AggregateRoot::version).next();
        if stored.version != expected {
            return Err(ReplayError::VersionGap {
                reference,
                expected,
                found: stored.version,
            });
        }

        let event = stored.decode::<A::Event>()?;
        Ok(Some(match root {
            None => {
                let state = A::mutate(None, &event)?;
                AggregateRoot::from_parts(
                    reference,
                    stored.version,
                    state,
                    stored.timestamp,
                    stored.timestamp,
                )
            }
            Some(root) => root.advance(stored.version, &event, stored.timestamp)?,
        }))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::Tally;
    use crate::event::NewEvent;
    use crate::event::test_fixtures::TallyEvent;
    use crate::stream::Position;
    use crate::Utc;
    use crate::event::DomainEvent;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn history(reference: AggregateId, bumps: &[u32]) -> Vec<StoredEvent> {
        let opened = TallyEvent::Opened {
            label: "laps".to_string(),
        };
        std::iter::once(opened)
            .chain(bumps.iter().map(|by| TallyEvent::Bumped { by: *by }))
            .enumerate()
            .map(|(i, event)| {
                let n = i as u64 + 1;
                NewEvent::from_domain("tally", &event, Version::new(n), Utc::now())
                    .unwrap()
                    .into_stored(reference, Position::new(n))
            })
            .collect()
    }

    #[test]
    fn empty_history_without_seed_is_none() {
        let root = fold::<Tally>(AggregateId::random(), None, &[]).unwrap();
        assert!(root.is_none());
    }

    #[test]
    fn full_history_rebuilds_state_and_version() {
        let reference = AggregateId::random();
        let root = fold::<Tally>(reference, None, &history(reference, &[1, 2, 3]))
            .unwrap()
            .unwrap();

        assert_eq!(root.version(), Version::new(4));
        assert_eq!(root.state().total, 6);
        assert!(!root.has_pending());
        assert_eq!(root.reference(), reference);
    }

    #[test]
    fn gap_in_versions_is_rejected() {
        let reference = AggregateId::random();
        let mut events = history(reference, &[1, 2, 3]);
        events.remove(2);

        let err = fold::<Tally>(reference, None, &events).unwrap_err();
        assert!(matches!(
            err,
            ReplayError::VersionGap { expected, found, .. }
                if expected == Version::new(3) && found == Version::new(4)
        ));
    }

    #[test]
    fn stray_event_is_rejected() {
        let reference = AggregateId::random();
        let other = history(AggregateId::random(), &[]);

        assert!(matches!(
            fold::<Tally>(reference, None, &other),
            Err(ReplayError::WrongReference { .. })
        ));
    }

    #[test]
    fn unknown_event_type_is_fatal() {
        let reference = AggregateId::random();
        let mut events = history(reference, &[1]);
        events[1].event_type = "Tally.Reset".to_string();

        assert!(matches!(
            fold::<Tally>(reference, None, &events),
            Err(ReplayError::Event(EventError::UnknownEventType(_)))
        ));
    }

    #[test]
    fn history_starting_without_creation_is_rejected() {
        let reference = AggregateId::random();
        let mut events = history(reference, &[5]);
        events.remove(0);
        events[0].version = Version::new(1);

        assert!(matches!(
            fold::<Tally>(reference, None, &events),
            Err(ReplayError::Mutation(MutationError::NotCreated { .. }))
        ));
    }

    static LEDGER_CLONES: AtomicUsize = AtomicUsize::new(0);

    /// Counts its clones, to check that replay moves the value along.
    #[derive(Debug, Serialize, Deserialize)]
    struct Ledger {
        lines: Vec<u32>,
    }

    impl Clone for Ledger {
        fn clone(&self) -> Self {
            LEDGER_CLONES.fetch_add(1, AtomicOrdering::SeqCst);
            Self {
                lines: self.lines.clone(),
            }
        }
    }

    impl Aggregate for Ledger {
        const KIND: &'static str = "tally";
        type Event = TallyEvent;

        fn mutate(state: Option<Self>, event: &TallyEvent) -> Result<Self, MutationError> {
            match (state, event) {
                (None, TallyEvent::Opened { .. }) => Ok(Self { lines: Vec::new() }),
                (Some(mut ledger), TallyEvent::Bumped { by }) => {
                    ledger.lines.push(*by);
                    Ok(ledger)
                }
                (Some(_), e) => Err(MutationError::AlreadyCreated {
                    event_type: e.event_type(),
                }),
                (None, e) => Err(MutationError::NotCreated {
                    event_type: e.event_type(),
                }),
            }
        }
    }

    #[test]
    fn replay_never_clones_the_value() {
        let reference = AggregateId::random();
        let bumps: Vec<u32> = (1..=200).collect();

        let root = fold::<Ledger>(reference, None, &history(reference, &bumps))
            .unwrap()
            .unwrap();

        assert_eq!(root.state().lines, bumps);
        assert_eq!(LEDGER_CLONES.load(AtomicOrdering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn snapshot_plus_tail_equals_full_replay(
            bumps in prop::collection::vec(1u32..1000, 0..40),
            split in 0usize..41,
        ) {
            let reference = AggregateId::random();
            let events = history(reference, &bumps);
            let split = split.min(events.len() - 1) + 1;

            let full = fold::<Tally>(reference, None, &events).unwrap().unwrap();

            let head = fold::<Tally>(reference, None, &events[..split]).unwrap().unwrap();
            let snapshot = head.to_snapshot(Utc::now()).unwrap();
            let seed = AggregateRoot::<Tally>::from_snapshot(&snapshot).unwrap();
            let resumed = fold::<Tally>(reference, Some(seed), &events[split..]).unwrap().unwrap();

            prop_assert_eq!(resumed.state(), full.state());
            prop_assert_eq!(resumed.version(), full.version());
        }

        #[test]
        fn replay_is_deterministic(bumps in prop::collection::vec(any::<u32>(), 0..20)) {
            let reference = AggregateId::random();
            let events = history(reference, &bumps);

            let a = fold::<Tally>(reference, None, &events).unwrap().unwrap();
            let b = fold::<Tally>(reference, None, &events).unwrap().unwrap();

            prop_assert_eq!(a.state(), b.state());
            prop_assert_eq!(a.version().value(), bumps.len() as u64 + 1);
        }
    }
}
