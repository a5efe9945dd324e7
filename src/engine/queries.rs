use std::collections::BTreeMap;

use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_LISTED;
use crate::model::*;

use super::{Engine, EngineError};

/// Days since the epoch in the lot's local time.
fn local_day(instant: Ms, utc_offset_minutes: i32) -> i64 {
    (instant + Ms::from(utc_offset_minutes) * 60_000).div_euclid(DAY_MS)
}

impl Engine {
    pub async fn get_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        self.store.get_by_id(id).await
    }

    pub async fn list_slots(&self) -> Vec<Slot> {
        self.store.list_all().await
    }

    pub async fn list_slots_with_status(&self, status: SlotStatus) -> Vec<Slot> {
        let mut slots = self.store.list_all().await;
        slots.retain(|s| s.status == status);
        slots
    }

    pub async fn list_available(&self) -> Vec<Slot> {
        self.list_slots_with_status(SlotStatus::Available).await
    }

    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.booking(&id).ok_or(EngineError::NotFound(id))
    }

    /// Most recent bookings first, capped.
    pub fn list_bookings(&self) -> Vec<Booking> {
        let mut bookings = self.store.bookings();
        bookings.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        bookings.truncate(MAX_BOOKINGS_LISTED);
        bookings
    }

    pub async fn current_stats(&self) -> OccupancyStats {
        self.store.counts().await
    }

    pub async fn slots_by_floor(&self) -> Vec<FloorSummary> {
        let mut floors: BTreeMap<i32, FloorSummary> = BTreeMap::new();
        for slot in self.store.list_all().await {
            let summary = floors.entry(slot.floor).or_insert_with(|| FloorSummary {
                floor: slot.floor,
                stats: OccupancyStats::default(),
                slots: Vec::new(),
            });
            summary.stats.tally(slot.status);
            summary.slots.push(slot);
        }
        floors.into_values().collect()
    }

    pub fn booking_totals(&self) -> BookingTotals {
        let offset = self.options.utc_offset_minutes;
        let today = local_day(self.now(), offset);
        let mut totals = BookingTotals::default();
        for booking in self.store.bookings() {
            totals.total += 1;
            if booking.is_active() {
                totals.active += 1;
            }
            if local_day(booking.start_time, offset) == today {
                totals.today += 1;
            }
        }
        totals
    }

    pub async fn dashboard(&self) -> Dashboard {
        Dashboard {
            slots: self.store.counts().await,
            bookings: self.booking_totals(),
            hourly_averages: self.hourly_averages().await,
        }
    }
}
