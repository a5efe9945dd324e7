use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedSlot = Arc<RwLock<SlotState>>;

/// A slot row together with the booking currently holding it.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    pub active_booking: Option<Ulid>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            active_booking: None,
        }
    }

    /// The only status mutation. Statuses that cannot hold a vehicle drop the
    /// vehicle number whatever was passed.
    pub fn set_status(&mut self, status: SlotStatus, vehicle_number: Option<String>, at: Ms) -> &Slot {
        self.slot.status = status;
        self.slot.vehicle_number = if status.holds_vehicle() {
            vehicle_number
        } else {
            None
        };
        self.slot.updated_at = at;
        &self.slot
    }
}

/// Slot and booking tables.
///
/// Each slot sits behind its own lock; that lock is the row lock for the slot
/// and for every booking that references it. Bookings are only written while
/// the owning slot's write guard is held.
pub struct SlotStore {
    slots: DashMap<Ulid, SharedSlot>,
    bookings: DashMap<Ulid, Booking>,
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            bookings: DashMap::new(),
        }
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn insert(&self, slot: Slot) {
        self.slots
            .insert(slot.id, Arc::new(RwLock::new(SlotState::new(slot))));
    }

    fn all(&self) -> Vec<SharedSlot> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn get_by_id(&self, id: Ulid) -> Result<Slot, EngineError> {
        let slot = self.get(&id).ok_or(EngineError::NotFound(id))?;
        let guard = slot.read().await;
        Ok(guard.slot.clone())
    }

    /// Every slot, ordered by floor and then slot number.
    pub async fn list_all(&self) -> Vec<Slot> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in self.all() {
            out.push(slot.read().await.slot.clone());
        }
        out.sort_by(|a, b| {
            a.floor
                .cmp(&b.floor)
                .then_with(|| a.slot_number.cmp(&b.slot_number))
        });
        out
    }

    /// Live counts. Reads every slot under a shared lock; nothing is cached.
    pub async fn counts(&self) -> OccupancyStats {
        let mut stats = OccupancyStats::default();
        for slot in self.all() {
            stats.tally(slot.read().await.slot.status);
        }
        stats
    }

    /// Take the slot's row lock, waiting at most `wait`.
    pub async fn lock(
        &self,
        id: Ulid,
        wait: Duration,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot = self.get(&id).ok_or(EngineError::NotFound(id))?;
        let started = Instant::now();
        let guard = tokio::time::timeout(wait, slot.write_owned())
            .await
            .map_err(|_| EngineError::Timeout(id))?;
        metrics::histogram!(crate::observability::SLOT_LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(guard)
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn bookings(&self) -> Vec<Booking> {
        self.bookings.iter().map(|e| e.value().clone()).collect()
    }

    fn mark_cancelled(&self, state: &mut SlotState, booking_id: &Ulid) {
        if let Some(mut booking) = self.bookings.get_mut(booking_id) {
            booking.status = BookingStatus::Cancelled;
        }
        if state.active_booking == Some(*booking_id) {
            state.active_booking = None;
        }
    }

    // ── Event application ────────────────────────────────────

    /// Rebuild state from one logged event while nothing else can hold a
    /// lock. Snapshots are not slot state and are ignored here.
    pub fn replay_event(&self, event: &Event) {
        match event {
            Event::SlotCreated {
                id,
                slot_number,
                floor,
                slot_type,
                at,
            } => {
                self.insert(Slot::new(*id, slot_number.clone(), *floor, *slot_type, *at));
            }
            Event::SnapshotRecorded(_) => {}
            other => {
                if let Some(slot_id) = other.slot_id()
                    && let Some(slot) = self.get(&slot_id)
                {
                    let mut guard = slot.try_write().expect("replay: uncontended write");
                    self.apply_event(&mut guard, other);
                }
            }
        }
    }

    /// Every slot's state, for a store nobody else is using.
    pub fn replayed_states(&self) -> Vec<SlotState> {
        self.all()
            .into_iter()
            .map(|slot| {
                let guard = slot.try_read().expect("replay: uncontended read");
                SlotState::clone(&guard)
            })
            .collect()
    }

    /// Apply a committed event to its slot. The caller holds the slot's write lock.
    pub fn apply_event(&self, state: &mut SlotState, event: &Event) {
        match event {
            Event::SlotReserved { booking } => {
                state.set_status(
                    SlotStatus::Reserved,
                    Some(booking.vehicle_number.clone()),
                    booking.start_time,
                );
                state.active_booking = Some(booking.id);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingCancelled { id, at, .. } => {
                self.mark_cancelled(state, id);
                state.set_status(SlotStatus::Available, None, *at);
            }
            Event::SlotStatusSet {
                status,
                vehicle_number,
                at,
                cancelled_booking,
                ..
            } => {
                if let Some(booking_id) = cancelled_booking {
                    self.mark_cancelled(state, booking_id);
                }
                state.set_status(*status, vehicle_number.clone(), *at);
            }
            Event::BookingArchived { booking } => {
                self.bookings.insert(booking.id, booking.clone());
            }
            // Slot creation happens at the map level; snapshots do not touch slots.
            Event::SlotCreated { .. } | Event::SnapshotRecorded(_) => {}
        }
    }
}
