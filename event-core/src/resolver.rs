//! Deterministic conflict resolution during replay
//!
//! Two producers that incremented their clocks independently can collide
//! at the same causal position for the same entity. The resolution rule
//! is last-write-wins on the event id: ids are lexicographically
//! time-sortable and globally unique, so every replica picks the same
//! winner with no coordination. Detected conflicts are always surfaced —
//! silent resolution is disallowed.
//!
//! Resolution applies to state-machine-style entities (single current
//! value per field); set-valued or counter-valued merges are out of
//! scope.

use crate::error::{Error, Result};
use crate::metrics::CONFLICTS_DETECTED_TOTAL;
use crate::types::{Conflict, EntityState, WorkflowEvent};

/// Result of replaying one entity's events
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    /// The derived state
    pub state: EntityState,
    /// Conflicts resolved along the way (already logged)
    pub conflicts: Vec<Conflict>,
}

/// Partition a causally sorted event sequence into the events to apply
/// and the conflicts resolved away.
///
/// `events` must already be sorted by `(logical_clock, event_id)` and
/// belong to a single entity. Within a same-clock group the
/// lexicographically greatest event id wins; the rest are dropped from
/// the replay and reported.
pub fn resolve(events: &[WorkflowEvent]) -> (Vec<&WorkflowEvent>, Vec<Conflict>) {
    let mut winners = Vec::new();
    let mut conflicts = Vec::new();

    let mut i = 0;
    while i < events.len() {
        let mut j = i + 1;
        while j < events.len() && events[j].logical_clock == events[i].logical_clock {
            j += 1;
        }

        // Sorted input: the last member of a same-clock group has the
        // greatest event id.
        let winner = &events[j - 1];
        if j - i > 1 {
            let losers: Vec<_> = events[i..j - 1].iter().map(|e| e.event_id).collect();
            CONFLICTS_DETECTED_TOTAL.inc();
            tracing::warn!(
                entity_id = %winner.entity_id,
                logical_clock = winner.logical_clock,
                winner = %winner.event_id,
                losers = ?losers.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                "Concurrent writes at the same causal position; last write wins"
            );
            conflicts.push(Conflict {
                entity_id: winner.entity_id.clone(),
                logical_clock: winner.logical_clock,
                winner: winner.event_id,
                losers,
            });
        }
        winners.push(winner);
        i = j;
    }

    (winners, conflicts)
}

/// Replay one entity's causally sorted events into a state projection.
///
/// Returns `None` for an empty event sequence (unknown entity).
pub fn reconstruct(events: &[WorkflowEvent]) -> Result<Option<Reconstruction>> {
    let first = match events.first() {
        Some(first) => first,
        None => return Ok(None),
    };

    if events.iter().any(|e| e.entity_id != first.entity_id) {
        return Err(Error::InvalidEvent(
            "Reconstruction requires events for a single entity".to_string(),
        ));
    }

    let (winners, conflicts) = resolve(events);

    let mut state = EntityState::new(first.entity_id.clone(), first.entity_type);
    for event in winners {
        state.apply(event)?;
    }

    Ok(Some(Reconstruction { state, conflicts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, EntityType, EventId, EventPayload};
    use chrono::Utc;
    use std::str::FromStr;

    fn status_event(id: &str, clock: u64, to: &str) -> WorkflowEvent {
        WorkflowEvent {
            event_id: EventId::from_str(id).unwrap(),
            entity_id: EntityId::new("WP-1"),
            entity_type: EntityType::WorkPackage,
            logical_clock: clock,
            node_id: "node-a".to_string(),
            causation_id: None,
            correlation_id: None,
            team_id: None,
            timestamp: Utc::now(),
            payload: EventPayload::StatusChanged {
                from: None,
                to: to.to_string(),
                note: None,
            },
        }
    }

    fn sorted(mut events: Vec<WorkflowEvent>) -> Vec<WorkflowEvent> {
        events.sort_by(|a, b| {
            a.logical_clock
                .cmp(&b.logical_clock)
                .then(a.event_id.cmp(&b.event_id))
        });
        events
    }

    const ID_A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAA";
    const ID_B: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAB";
    const ID_C: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAC";

    #[test]
    fn test_no_conflict_applies_everything() {
        let events = sorted(vec![
            status_event(ID_A, 1, "doing"),
            status_event(ID_B, 2, "review"),
        ]);

        let result = reconstruct(&events).unwrap().unwrap();
        assert!(result.conflicts.is_empty());
        assert_eq!(result.state.status.as_deref(), Some("review"));
        assert_eq!(result.state.applied_events.len(), 2);
    }

    #[test]
    fn test_same_clock_resolves_to_greatest_event_id() {
        let events = sorted(vec![
            status_event(ID_A, 5, "doing"),
            status_event(ID_B, 5, "blocked"),
        ]);

        let result = reconstruct(&events).unwrap().unwrap();
        assert_eq!(result.conflicts.len(), 1);

        let conflict = &result.conflicts[0];
        assert_eq!(conflict.logical_clock, 5);
        assert_eq!(conflict.winner, EventId::from_str(ID_B).unwrap());
        assert_eq!(conflict.losers, vec![EventId::from_str(ID_A).unwrap()]);

        // B's payload wins; A's was not applied
        assert_eq!(result.state.status.as_deref(), Some("blocked"));
        assert_eq!(result.state.applied_events.len(), 1);
    }

    #[test]
    fn test_three_way_conflict() {
        let events = sorted(vec![
            status_event(ID_B, 3, "review"),
            status_event(ID_A, 3, "doing"),
            status_event(ID_C, 3, "done"),
        ]);

        let (winners, conflicts) = resolve(&events);
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].event_id, EventId::from_str(ID_C).unwrap());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].losers.len(), 2);
    }

    #[test]
    fn test_resolution_is_deterministic_across_replays() {
        let events = sorted(vec![
            status_event(ID_A, 1, "doing"),
            status_event(ID_C, 2, "blocked"),
            status_event(ID_B, 2, "review"),
        ]);

        let first = reconstruct(&events).unwrap().unwrap();
        for _ in 0..10 {
            let again = reconstruct(&events).unwrap().unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(first.state.status.as_deref(), Some("blocked"));
    }

    #[test]
    fn test_empty_sequence_yields_none() {
        assert!(reconstruct(&[]).unwrap().is_none());
    }

    #[test]
    fn test_mixed_entities_rejected() {
        let mut other = status_event(ID_B, 2, "doing");
        other.entity_id = EntityId::new("WP-2");
        let events = vec![status_event(ID_A, 1, "doing"), other];

        assert!(reconstruct(&events).is_err());
    }
}
