use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{CANCELLATIONS_TOTAL, RESERVATIONS_TOTAL, WAL_COMPACTIONS_TOTAL};

use super::{Engine, EngineError, WalCommand};

/// Input to [`Engine::reserve`]. `slot_id` is optional so that a missing
/// slot is reported the same way as any other missing field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReserveRequest {
    pub user_name: String,
    pub user_phone: String,
    pub vehicle_number: String,
    pub slot_id: Option<Ulid>,
    /// Defaults to two hours.
    pub duration_hours: Option<u32>,
}

impl ReserveRequest {
    pub fn new(
        user_name: impl Into<String>,
        user_phone: impl Into<String>,
        vehicle_number: impl Into<String>,
        slot_id: Ulid,
    ) -> Self {
        Self {
            user_name: user_name.into(),
            user_phone: user_phone.into(),
            vehicle_number: vehicle_number.into(),
            slot_id: Some(slot_id),
            duration_hours: None,
        }
    }

    pub fn hours(mut self, duration_hours: u32) -> Self {
        self.duration_hours = Some(duration_hours);
        self
    }

    fn validate(&self) -> Result<(Ulid, u32), EngineError> {
        required("user_name", &self.user_name, MAX_USER_NAME_LEN)?;
        required("user_phone", &self.user_phone, MAX_USER_PHONE_LEN)?;
        required("vehicle_number", &self.vehicle_number, MAX_VEHICLE_NUMBER_LEN)?;
        let slot_id = self
            .slot_id
            .ok_or_else(|| EngineError::validation("missing required field: slot_id"))?;
        let hours = self.duration_hours.unwrap_or(DEFAULT_DURATION_HOURS);
        if !(1..=MAX_DURATION_HOURS).contains(&hours) {
            return Err(EngineError::validation(format!(
                "duration_hours must be 1-{MAX_DURATION_HOURS}, got {hours}"
            )));
        }
        Ok((slot_id, hours))
    }
}

/// Trimmed, non-empty and within `max` bytes.
fn required<'a>(field: &str, value: &'a str, max: usize) -> Result<&'a str, EngineError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(EngineError::validation(format!("missing required field: {field}")));
    }
    if v.len() > max {
        return Err(EngineError::validation(format!("{field} longer than {max}")));
    }
    Ok(v)
}

fn outcome_label(result: &Result<Booking, EngineError>) -> &'static str {
    match result {
        Ok(_) => "reserved",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::Validation(_) | EngineError::AlreadyExists(_)) => "invalid",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::Timeout(_)) => "timeout",
        Err(EngineError::Storage(_)) => "storage",
    }
}

impl Engine {
    // ── Bookings ─────────────────────────────────────────────

    /// Book an available slot. The slot's row lock is held from the
    /// availability check until the booking is durable and applied, so two
    /// callers racing for one slot get exactly one booking.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<Booking, EngineError> {
        let result = self.reserve_locked(&req).await;
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        let booking = result?;
        self.record_snapshot().await;
        Ok(booking)
    }

    async fn reserve_locked(&self, req: &ReserveRequest) -> Result<Booking, EngineError> {
        let (slot_id, duration_hours) = req.validate()?;
        let mut guard = self.store.lock(slot_id, self.options.lock_timeout).await?;
        if guard.slot.status != SlotStatus::Available {
            debug!(slot = %slot_id, status = guard.slot.status.as_str(), "reserve rejected");
            return Err(EngineError::Conflict(slot_id));
        }

        let start_time = self.now();
        let booking = Booking {
            id: Ulid::new(),
            user_name: req.user_name.trim().to_string(),
            user_phone: req.user_phone.trim().to_string(),
            vehicle_number: req.vehicle_number.trim().to_string(),
            slot_id,
            slot_number: guard.slot.slot_number.clone(),
            start_time,
            end_time: start_time + Ms::from(duration_hours) * HOUR_MS,
            duration_hours,
            status: BookingStatus::Active,
        };
        let event = Event::SlotReserved {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking = %booking.id, slot = %booking.slot_number, "slot reserved");
        Ok(booking)
    }

    /// Cancel an active booking and release its slot. Returns the booking as
    /// it now stands.
    pub async fn cancel(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let slot_id = self
            .store
            .booking(&booking_id)
            .filter(Booking::is_active)
            .map(|b| b.slot_id)
            .ok_or(EngineError::NotFound(booking_id))?;

        let mut guard = self.store.lock(slot_id, self.options.lock_timeout).await?;
        // A concurrent cancel may have won while we waited for the lock.
        let booking = match self.store.booking(&booking_id) {
            Some(b) if b.is_active() => b,
            _ => return Err(EngineError::NotFound(booking_id)),
        };
        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
            at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(CANCELLATIONS_TOTAL).increment(1);
        info!(booking = %booking_id, slot = %booking.slot_number, "booking cancelled");
        self.record_snapshot().await;
        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..booking
        })
    }

    // ── Slot administration ──────────────────────────────────

    pub async fn create_slot(
        &self,
        id: Ulid,
        slot_number: &str,
        floor: i32,
        slot_type: SlotType,
    ) -> Result<Slot, EngineError> {
        let slot_number = required("slot_number", slot_number, MAX_SLOT_NUMBER_LEN)?;
        let _catalog = self.catalog.lock().await;
        if self.store.len() >= MAX_SLOTS {
            return Err(EngineError::validation(format!("lot already has {MAX_SLOTS} slots")));
        }
        if self.store.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let at = self.now();
        let event = Event::SlotCreated {
            id,
            slot_number: slot_number.to_string(),
            floor,
            slot_type,
            at,
        };
        self.wal_append(&event).await?;
        let slot = Slot::new(id, slot_number.to_string(), floor, slot_type, at);
        self.store.insert(slot.clone());
        Ok(slot)
    }

    /// Lay out `floors` floors of `slots_per_floor` slots on an empty lot:
    /// `A01, A02, …` on floor 1, `B01, …` on floor 2. The first slot of each
    /// floor is a handicap slot, the last two are EV. Returns how many slots
    /// were created; a lot that already has slots is left alone.
    pub async fn seed_layout(&self, floors: u32, slots_per_floor: u32) -> Result<usize, EngineError> {
        if !self.store.is_empty() {
            return Ok(0);
        }
        if floors > MAX_SEED_FLOORS {
            return Err(EngineError::validation(format!(
                "at most {MAX_SEED_FLOORS} floors can be seeded"
            )));
        }
        if (floors as usize) * (slots_per_floor as usize) > MAX_SLOTS {
            return Err(EngineError::validation(format!("lot limited to {MAX_SLOTS} slots")));
        }

        let mut created = 0;
        for floor in 1..=floors {
            let letter = char::from(b'A' + (floor - 1) as u8);
            for n in 1..=slots_per_floor {
                let slot_type = if n == 1 {
                    SlotType::Handicap
                } else if n + 2 > slots_per_floor {
                    SlotType::Ev
                } else {
                    SlotType::Regular
                };
                self.create_slot(Ulid::new(), &format!("{letter}{n:02}"), floor as i32, slot_type)
                    .await?;
                created += 1;
            }
        }
        info!("seeded {created} slots on {floors} floors");
        Ok(created)
    }

    /// Take a slot out of service. Any active booking on it is cancelled in
    /// the same record.
    pub async fn force_maintenance(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        self.set_status(slot_id, SlotStatus::Maintenance, None).await
    }

    /// Manual status override from a guard device or sensor.
    ///
    /// `occupied` needs a vehicle number; on a slot with an active booking it
    /// must be the booked vehicle, which keeps the booking. `available` and
    /// `maintenance` cancel the slot's active booking. `reserved` is refused:
    /// reservations only come from [`Engine::reserve`].
    pub async fn update_status(
        &self,
        slot_id: Ulid,
        status: SlotStatus,
        vehicle_number: Option<&str>,
    ) -> Result<Slot, EngineError> {
        let vehicle = match status {
            SlotStatus::Reserved => {
                return Err(EngineError::validation(
                    "slots are reserved by booking them, not by status override",
                ));
            }
            SlotStatus::Occupied => Some(
                required(
                    "vehicle_number",
                    vehicle_number.unwrap_or_default(),
                    MAX_VEHICLE_NUMBER_LEN,
                )?
                .to_string(),
            ),
            SlotStatus::Available | SlotStatus::Maintenance => None,
        };
        self.set_status(slot_id, status, vehicle).await
    }

    async fn set_status(
        &self,
        slot_id: Ulid,
        status: SlotStatus,
        vehicle_number: Option<String>,
    ) -> Result<Slot, EngineError> {
        let mut guard = self.store.lock(slot_id, self.options.lock_timeout).await?;
        if let (Some(arriving), Some(booking_id)) = (&vehicle_number, guard.active_booking)
            && let Some(booking) = self.store.booking(&booking_id)
            && booking.vehicle_number != *arriving
        {
            debug!(
                slot = %slot_id,
                booked = %booking.vehicle_number,
                arriving = %arriving,
                "occupied override rejected"
            );
            return Err(EngineError::Conflict(slot_id));
        }
        let cancelled_booking = match status {
            SlotStatus::Available | SlotStatus::Maintenance => guard.active_booking,
            _ => None,
        };
        let event = Event::SlotStatusSet {
            slot_id,
            status,
            vehicle_number,
            at: self.now(),
            cancelled_booking,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let slot = guard.slot.clone();
        drop(guard);

        if let Some(booking) = cancelled_booking {
            metrics::counter!(CANCELLATIONS_TOTAL).increment(1);
            info!(booking = %booking, slot = %slot.slot_number, "booking cancelled by status override");
        }
        debug!(slot = %slot.slot_number, status = status.as_str(), "status set");
        self.record_snapshot().await;
        Ok(slot)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild current state.
    ///
    /// The WAL writer folds the committed log off its task and keeps
    /// committing meanwhile; those records are appended to the folded file
    /// before it replaces the log. No slot or snapshot lock is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
