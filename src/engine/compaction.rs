use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::store::SlotStore;

/// Fold a committed history into a shorter one that replays to the same
/// slots, bookings and snapshots.
///
/// Per slot: its creation, then one status record pinning its current row.
/// A booking still holding its slot is re-reserved before the pins so the slot
/// keeps it; every other booking becomes a single `BookingArchived`.
pub fn compact_events(history: &[Event]) -> Vec<Event> {
    let store = SlotStore::new();
    let mut snapshots = Vec::new();
    for event in history {
        match event {
            Event::SnapshotRecorded(snapshot) => snapshots.push(*snapshot),
            other => store.replay_event(other),
        }
    }

    let mut states = store.replayed_states();
    states.sort_by_key(|s| s.slot.id);
    let holding: HashSet<Ulid> = states.iter().filter_map(|s| s.active_booking).collect();
    let mut bookings = store.bookings();
    bookings.sort_by_key(|b| (b.start_time, b.id));

    let mut events = Vec::with_capacity(states.len() * 2 + bookings.len() + snapshots.len());
    for state in &states {
        let slot = &state.slot;
        events.push(Event::SlotCreated {
            id: slot.id,
            slot_number: slot.slot_number.clone(),
            floor: slot.floor,
            slot_type: slot.slot_type,
            at: slot.updated_at,
        });
    }
    for booking in bookings {
        events.push(if holding.contains(&booking.id) {
            Event::SlotReserved { booking }
        } else {
            Event::BookingArchived { booking }
        });
    }
    for state in &states {
        events.push(Event::SlotStatusSet {
            slot_id: state.slot.id,
            status: state.slot.status,
            vehicle_number: state.slot.vehicle_number.clone(),
            at: state.slot.updated_at,
            cancelled_booking: None,
        });
    }
    events.extend(snapshots.into_iter().map(Event::SnapshotRecorded));
    events
}
