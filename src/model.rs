use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotType {
    Regular,
    Handicap,
    Ev,
}

impl SlotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotType::Regular => "regular",
            SlotType::Handicap => "handicap",
            SlotType::Ev => "ev",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" => Some(SlotType::Regular),
            "handicap" => Some(SlotType::Handicap),
            "ev" => Some(SlotType::Ev),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Occupied,
    Reserved,
    Maintenance,
}

impl SlotStatus {
    pub const ALL: [SlotStatus; 4] = [
        SlotStatus::Available,
        SlotStatus::Occupied,
        SlotStatus::Reserved,
        SlotStatus::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Occupied => "occupied",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Occupied and reserved slots carry a vehicle number; the others never do.
    pub fn holds_vehicle(&self) -> bool {
        matches!(self, SlotStatus::Occupied | SlotStatus::Reserved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub slot_number: String,
    pub floor: i32,
    pub slot_type: SlotType,
    pub status: SlotStatus,
    pub vehicle_number: Option<String>,
    pub updated_at: Ms,
}

impl Slot {
    pub fn new(id: Ulid, slot_number: String, floor: i32, slot_type: SlotType, at: Ms) -> Self {
        Self {
            id,
            slot_number,
            floor,
            slot_type,
            status: SlotStatus::Available,
            vehicle_number: None,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// A reservation of one slot. Everything except `status` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_name: String,
    pub user_phone: String,
    pub vehicle_number: String,
    pub slot_id: Ulid,
    /// Copied from the slot at creation so the booking still reads correctly
    /// if the slot is renumbered later.
    pub slot_number: String,
    pub start_time: Ms,
    pub end_time: Ms,
    pub duration_hours: u32,
    pub status: BookingStatus,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

/// The `(hour_of_day, day_of_week)` key snapshots are grouped by.
/// `day` counts from Sunday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bucket {
    pub hour: u8,
    pub day: u8,
}

impl Bucket {
    pub fn new(hour: u8, day: u8) -> Option<Self> {
        (hour < 24 && day < 7).then_some(Self { hour, day })
    }

    /// Local hour and weekday of `instant`, shifted by the lot's UTC offset.
    pub fn at(instant: Ms, utc_offset_minutes: i32) -> Self {
        let local = instant + Ms::from(utc_offset_minutes) * 60_000;
        let hour = local.rem_euclid(DAY_MS) / HOUR_MS;
        // 1970-01-01 was a Thursday.
        let day = (local.div_euclid(DAY_MS) + 4).rem_euclid(7);
        Self {
            hour: hour as u8,
            day: day as u8,
        }
    }
}

/// `round(100 · occupied / total)`; an empty lot reads as 0.
pub fn occupancy_rate(occupied: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (f64::from(occupied) * 100.0 / f64::from(total)).round() as u32
}

/// One immutable occupancy measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub recorded_at: Ms,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub occupied_count: u32,
    pub total_slots: u32,
    pub occupancy_rate: u32,
}

impl OccupancySnapshot {
    pub fn new(recorded_at: Ms, bucket: Bucket, occupied_count: u32, total_slots: u32) -> Self {
        Self {
            recorded_at,
            hour_of_day: bucket.hour,
            day_of_week: bucket.day,
            occupied_count,
            total_slots,
            occupancy_rate: occupancy_rate(occupied_count, total_slots),
        }
    }

    pub fn bucket(&self) -> Bucket {
        Bucket {
            hour: self.hour_of_day,
            day: self.day_of_week,
        }
    }
}

/// One flat event per committed transaction. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        slot_number: String,
        floor: i32,
        slot_type: SlotType,
        at: Ms,
    },
    /// Booking inserted and its slot moved to `reserved` in one record.
    SlotReserved {
        booking: Booking,
    },
    /// Booking cancelled and its slot released to `available` in one record.
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    /// Administrative status change, optionally cancelling the slot's active booking.
    SlotStatusSet {
        slot_id: Ulid,
        status: SlotStatus,
        vehicle_number: Option<String>,
        at: Ms,
        cancelled_booking: Option<Ulid>,
    },
    SnapshotRecorded(OccupancySnapshot),
    /// A finished booking carried over by compaction. Restores the booking
    /// row only; its slot is left alone.
    BookingArchived {
        booking: Booking,
    },
}

impl Event {
    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotCreated { id, .. } => Some(*id),
            Event::SlotReserved { booking } | Event::BookingArchived { booking } => {
                Some(booking.slot_id)
            }
            Event::BookingCancelled { slot_id, .. } | Event::SlotStatusSet { slot_id, .. } => {
                Some(*slot_id)
            }
            Event::SnapshotRecorded(_) => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Live slot counts, always computed from the slot store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccupancyStats {
    pub total: u32,
    pub available: u32,
    pub occupied: u32,
    pub reserved: u32,
    pub maintenance: u32,
    pub occupancy_rate: u32,
}

impl OccupancyStats {
    pub fn tally(&mut self, status: SlotStatus) {
        self.total += 1;
        match status {
            SlotStatus::Available => self.available += 1,
            SlotStatus::Occupied => self.occupied += 1,
            SlotStatus::Reserved => self.reserved += 1,
            SlotStatus::Maintenance => self.maintenance += 1,
        }
        self.occupancy_rate = occupancy_rate(self.occupied, self.total);
    }
}

/// One floor's counts and its slots, ordered by slot number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloorSummary {
    pub floor: i32,
    pub stats: OccupancyStats,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingTotals {
    pub total: u32,
    pub active: u32,
    pub today: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HourlyAverage {
    pub hour_of_day: u8,
    /// Mean occupancy rate across every snapshot in this hour, one decimal.
    pub avg_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dashboard {
    pub slots: OccupancyStats,
    pub bookings: BookingTotals,
    pub hourly_averages: Vec<HourlyAverage>,
}
