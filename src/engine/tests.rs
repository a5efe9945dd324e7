use super::*;
use crate::clock::ManualClock;
use std::path::Path;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

/// 1970-01-05 was a Monday.
const MONDAY_9AM: Ms = 4 * DAY_MS + 9 * HOUR_MS;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("parkd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: &Path, clock: Arc<ManualClock>, options: EngineOptions) -> Engine {
    Engine::new(path.to_path_buf(), clock, options).unwrap()
}

/// One floor of `slots` slots, clock parked at Monday 09:00 UTC.
async fn lot(name: &str, slots: u32) -> (Engine, Arc<ManualClock>, PathBuf) {
    let path = test_wal_path(name);
    let clock = Arc::new(ManualClock::new(MONDAY_9AM));
    let engine = open(&path, clock.clone(), EngineOptions::default());
    assert_eq!(engine.seed_layout(1, slots).await.unwrap(), slots as usize);
    (engine, clock, path)
}

async fn slot_ids(engine: &Engine) -> Vec<Ulid> {
    engine.list_slots().await.into_iter().map(|s| s.id).collect()
}

fn request(slot_id: Ulid) -> ReserveRequest {
    ReserveRequest::new("Asha Rao", "555-0100", "KA01AB1234", slot_id)
}

/// Available slots hold no vehicle and no active booking; reserved slots
/// hold exactly one active booking whose vehicle they carry.
async fn assert_consistent(engine: &Engine) {
    let bookings = engine.store.bookings();
    for slot in engine.list_slots().await {
        let active: Vec<&Booking> = bookings
            .iter()
            .filter(|b| b.slot_id == slot.id && b.is_active())
            .collect();
        match slot.status {
            SlotStatus::Available | SlotStatus::Maintenance => {
                assert_eq!(slot.vehicle_number, None, "{}", slot.slot_number);
                assert!(active.is_empty(), "{}", slot.slot_number);
            }
            SlotStatus::Reserved => {
                assert_eq!(active.len(), 1, "{}", slot.slot_number);
                assert_eq!(slot.vehicle_number.as_deref(), Some(active[0].vehicle_number.as_str()));
            }
            SlotStatus::Occupied => {
                assert!(slot.vehicle_number.is_some());
                assert!(active.len() <= 1);
            }
        }
    }
}

// ── Reserve ──────────────────────────────────────────────

#[tokio::test]
async fn reserve_books_slot_for_requested_window() {
    let (engine, _clock, _) = lot("reserve_window.wal", 20).await;
    let slot_a = slot_ids(&engine).await[0];

    let booking = engine.reserve(request(slot_a)).await.unwrap();
    assert_eq!(booking.start_time, MONDAY_9AM);
    assert_eq!(booking.end_time, MONDAY_9AM + 2 * HOUR_MS);
    assert_eq!(booking.duration_hours, 2);
    assert_eq!(booking.slot_number, "A01");
    assert!(booking.is_active());

    let slot = engine.get_slot(slot_a).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Reserved);
    assert_eq!(slot.vehicle_number.as_deref(), Some("KA01AB1234"));
    assert_eq!(slot.updated_at, MONDAY_9AM);
    assert_eq!(engine.snapshot_count().await, 1);
}

#[tokio::test]
async fn reserve_custom_duration_and_trims_fields() {
    let (engine, _clock, _) = lot("reserve_duration.wal", 2).await;
    let id = slot_ids(&engine).await[1];

    let req = ReserveRequest::new("  Ravi ", " 555-0101", "MH12XY9  ", id).hours(5);
    let booking = engine.reserve(req).await.unwrap();
    assert_eq!(booking.end_time - booking.start_time, 5 * HOUR_MS);
    assert_eq!(booking.user_name, "Ravi");
    assert_eq!(booking.user_phone, "555-0101");
    assert_eq!(booking.vehicle_number, "MH12XY9");
}

#[tokio::test]
async fn reserve_rejects_invalid_input_without_side_effects() {
    let (engine, _clock, _) = lot("reserve_invalid.wal", 3).await;
    let id = slot_ids(&engine).await[0];

    let cases = [
        ReserveRequest::new("", "555", "KA01", id),
        ReserveRequest::new("Asha", "   ", "KA01", id),
        ReserveRequest::new("Asha", "555", "\t", id),
        ReserveRequest {
            slot_id: None,
            ..request(id)
        },
        request(id).hours(0),
        request(id).hours(73),
        ReserveRequest::new("Asha", "555", "X".repeat(40), id),
    ];
    for req in cases {
        let err = assert_err!(engine.reserve(req).await);
        assert!(matches!(err, EngineError::Validation(_)), "{err}");
    }

    assert_eq!(engine.get_slot(id).await.unwrap().status, SlotStatus::Available);
    assert!(engine.list_bookings().is_empty());
    assert_eq!(engine.snapshot_count().await, 0);
}

#[tokio::test]
async fn reserve_unknown_slot_is_not_found() {
    let (engine, _clock, _) = lot("reserve_unknown.wal", 1).await;
    let ghost = Ulid::new();
    assert!(matches!(
        engine.reserve(request(ghost)).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));
}

#[tokio::test]
async fn reserve_non_available_slot_conflicts() {
    let (engine, _clock, _) = lot("reserve_conflict.wal", 3).await;
    let ids = slot_ids(&engine).await;

    engine.reserve(request(ids[0])).await.unwrap();
    engine.force_maintenance(ids[1]).await.unwrap();
    engine
        .update_status(ids[2], SlotStatus::Occupied, Some("DL3C0001"))
        .await
        .unwrap();

    for id in ids {
        assert!(matches!(
            engine.reserve(request(id)).await,
            Err(EngineError::Conflict(x)) if x == id
        ));
    }
    assert_eq!(engine.list_bookings().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_admit_exactly_one() {
    let (engine, _clock, _) = lot("reserve_race.wal", 5).await;
    let engine = Arc::new(engine);
    let target = slot_ids(&engine).await[2];

    let mut handles = Vec::new();
    for i in 0..32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let req = ReserveRequest::new(format!("driver {i}"), "555", format!("V{i:03}"), target);
            engine.reserve(req).await
        }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::Conflict(id)) => {
                assert_eq!(id, target);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 31);

    assert_eq!(engine.get_slot(target).await.unwrap().status, SlotStatus::Reserved);
    let active = engine
        .store
        .bookings()
        .into_iter()
        .filter(|b| b.slot_id == target && b.is_active())
        .count();
    assert_eq!(active, 1);
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn reserve_times_out_on_held_row_lock() {
    let path = test_wal_path("reserve_timeout.wal");
    let clock = Arc::new(ManualClock::new(MONDAY_9AM));
    let options = EngineOptions {
        lock_timeout: Duration::from_millis(30),
        ..EngineOptions::default()
    };
    let engine = open(&path, clock, options);
    engine.seed_layout(1, 2).await.unwrap();
    let id = slot_ids(&engine).await[0];

    let held = engine.store.lock(id, Duration::from_secs(1)).await.unwrap();
    assert!(matches!(
        engine.reserve(request(id)).await,
        Err(EngineError::Timeout(x)) if x == id
    ));
    drop(held);

    assert_eq!(engine.get_slot(id).await.unwrap().status, SlotStatus::Available);
    assert_ok!(engine.reserve(request(id)).await);
}

// ── Cancel ───────────────────────────────────────────────

#[tokio::test]
async fn reserve_then_cancel_round_trips() {
    let (engine, clock, _) = lot("cancel_round_trip.wal", 4).await;
    let id = slot_ids(&engine).await[0];
    let before = engine.current_stats().await;

    let booking = engine.reserve(request(id)).await.unwrap();
    clock.advance(10 * 60_000);
    let cancelled = engine.cancel(booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.id, booking.id);

    let slot = engine.get_slot(id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Available);
    assert_eq!(slot.vehicle_number, None);
    assert_eq!(slot.updated_at, MONDAY_9AM + 10 * 60_000);
    assert_eq!(
        engine.get_booking(booking.id).unwrap().status,
        BookingStatus::Cancelled
    );
    assert_eq!(engine.current_stats().await, before);

    assert!(matches!(
        engine.cancel(booking.id).await,
        Err(EngineError::NotFound(x)) if x == booking.id
    ));
    assert!(matches!(
        engine.cancel(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
    assert_consistent(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_admit_exactly_one() {
    let (engine, _clock, _) = lot("cancel_race.wal", 2).await;
    let engine = Arc::new(engine);
    let id = slot_ids(&engine).await[0];
    let booking = engine.reserve(request(id)).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.cancel(booking.id).await })
        })
        .collect();
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::NotFound(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.get_slot(id).await.unwrap().status, SlotStatus::Available);
}

#[tokio::test]
async fn slot_can_be_rebooked_after_cancel() {
    let (engine, _clock, _) = lot("rebook.wal", 1).await;
    let id = slot_ids(&engine).await[0];

    let first = engine.reserve(request(id)).await.unwrap();
    engine.cancel(first.id).await.unwrap();
    let second = engine.reserve(request(id)).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(engine.list_bookings().len(), 2);
    assert_consistent(&engine).await;
}

// ── Status overrides ─────────────────────────────────────

#[tokio::test]
async fn force_maintenance_cancels_active_booking() {
    let (engine, _clock, _) = lot("maintenance_cancels.wal", 3).await;
    let id = slot_ids(&engine).await[0];
    let booking = engine.reserve(request(id)).await.unwrap();

    let slot = engine.force_maintenance(id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Maintenance);
    assert_eq!(slot.vehicle_number, None);
    assert_eq!(
        engine.get_booking(booking.id).unwrap().status,
        BookingStatus::Cancelled
    );
    assert!(engine.cancel(booking.id).await.is_err());
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn update_status_rules() {
    let (engine, _clock, _) = lot("update_status.wal", 3).await;
    let ids = slot_ids(&engine).await;

    // reserved only comes from a booking
    assert!(matches!(
        engine.update_status(ids[0], SlotStatus::Reserved, Some("KA01")).await,
        Err(EngineError::Validation(_))
    ));
    // occupied needs a vehicle
    assert!(matches!(
        engine.update_status(ids[0], SlotStatus::Occupied, None).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.update_status(ids[0], SlotStatus::Occupied, Some("  ")).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.update_status(Ulid::new(), SlotStatus::Available, None).await,
        Err(EngineError::NotFound(_))
    ));

    let slot = engine
        .update_status(ids[0], SlotStatus::Occupied, Some("DL3C0001"))
        .await
        .unwrap();
    assert_eq!(slot.status, SlotStatus::Occupied);
    assert_eq!(slot.vehicle_number.as_deref(), Some("DL3C0001"));

    // Guard clears a reserved slot: the booking goes with it.
    let booking = engine.reserve(request(ids[1])).await.unwrap();
    let slot = engine
        .update_status(ids[1], SlotStatus::Available, Some("ignored"))
        .await
        .unwrap();
    assert_eq!(slot.vehicle_number, None);
    assert!(!engine.get_booking(booking.id).unwrap().is_active());

    // Every accepted override recorded a snapshot (plus the reservation).
    assert_eq!(engine.snapshot_count().await, 3);
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn arrival_on_reserved_slot_keeps_booking() {
    let (engine, _clock, _) = lot("arrival.wal", 1).await;
    let id = slot_ids(&engine).await[0];
    let booking = engine.reserve(request(id)).await.unwrap();

    engine
        .update_status(id, SlotStatus::Occupied, Some("KA01AB1234"))
        .await
        .unwrap();
    assert!(engine.get_booking(booking.id).unwrap().is_active());
    assert_eq!(engine.current_stats().await.occupied, 1);

    // Cancelling afterwards releases the slot.
    engine.cancel(booking.id).await.unwrap();
    assert_eq!(engine.get_slot(id).await.unwrap().status, SlotStatus::Available);
}

#[tokio::test]
async fn arrival_with_other_vehicle_is_refused() {
    let (engine, _clock, _) = lot("arrival_mismatch.wal", 1).await;
    let id = slot_ids(&engine).await[0];
    let booking = engine.reserve(request(id)).await.unwrap();

    assert!(matches!(
        engine.update_status(id, SlotStatus::Occupied, Some("MH12XY0001")).await,
        Err(EngineError::Conflict(x)) if x == id
    ));
    let slot = engine.get_slot(id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Reserved);
    assert_eq!(slot.vehicle_number.as_deref(), Some("KA01AB1234"));
    assert!(engine.get_booking(booking.id).unwrap().is_active());

    // The booked vehicle is let in.
    let slot = assert_ok!(
        engine
            .update_status(id, SlotStatus::Occupied, Some("KA01AB1234"))
            .await
    );
    assert_eq!(slot.status, SlotStatus::Occupied);
    assert_consistent(&engine).await;
}

// ── Slots ────────────────────────────────────────────────

#[tokio::test]
async fn seed_layout_numbers_and_types() {
    let path = test_wal_path("seed_layout.wal");
    let engine = open(&path, Arc::new(ManualClock::new(0)), EngineOptions::default());
    assert_eq!(engine.seed_layout(2, 10).await.unwrap(), 20);

    let slots = engine.list_slots().await;
    assert_eq!(slots.len(), 20);
    assert_eq!(slots[0].slot_number, "A01");
    assert_eq!(slots[0].slot_type, SlotType::Handicap);
    assert_eq!(slots[1].slot_type, SlotType::Regular);
    assert_eq!(slots[8].slot_type, SlotType::Ev);
    assert_eq!(slots[9].slot_number, "A10");
    assert_eq!(slots[9].slot_type, SlotType::Ev);
    assert_eq!(slots[10].slot_number, "B01");
    assert_eq!(slots[10].floor, 2);
    assert!(slots.iter().all(|s| s.status == SlotStatus::Available));

    // Already laid out: nothing happens.
    assert_eq!(engine.seed_layout(3, 5).await.unwrap(), 0);
    assert_eq!(engine.store.len(), 20);

    let floors = engine.slots_by_floor().await;
    assert_eq!(floors.len(), 2);
    assert_eq!(floors[1].floor, 2);
    assert_eq!(floors[1].stats.available, 10);
    let numbers: Vec<&str> = floors[1].slots.iter().map(|s| s.slot_number.as_str()).collect();
    assert_eq!(
        numbers,
        ["B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B09", "B10"]
    );
    assert!(floors[1].slots.iter().all(|s| s.floor == 2));
}

#[tokio::test]
async fn create_slot_rejects_duplicates_and_blanks() {
    let path = test_wal_path("create_slot.wal");
    let engine = open(&path, Arc::new(ManualClock::new(0)), EngineOptions::default());
    let id = Ulid::new();

    engine.create_slot(id, "C07", 3, SlotType::Ev).await.unwrap();
    assert!(matches!(
        engine.create_slot(id, "C08", 3, SlotType::Regular).await,
        Err(EngineError::AlreadyExists(x)) if x == id
    ));
    assert!(matches!(
        engine.create_slot(Ulid::new(), "  ", 3, SlotType::Regular).await,
        Err(EngineError::Validation(_))
    ));
    assert_eq!(engine.list_available().await.len(), 1);
}

// ── Snapshots and prediction ─────────────────────────────

#[tokio::test]
async fn empty_lot_records_nothing() {
    let path = test_wal_path("empty_lot.wal");
    let engine = open(&path, Arc::new(ManualClock::new(0)), EngineOptions::default());
    assert!(matches!(
        engine.try_record_snapshot().await,
        Err(TelemetryError::EmptyLot)
    ));
    assert_eq!(engine.record_snapshot().await, None);
    assert_eq!(engine.snapshot_count().await, 0);
}

#[tokio::test]
async fn snapshot_counts_only_occupied_slots() {
    let (engine, _clock, _) = lot("snapshot_occupied.wal", 4).await;
    let ids = slot_ids(&engine).await;
    engine.reserve(request(ids[0])).await.unwrap();
    engine
        .update_status(ids[1], SlotStatus::Occupied, Some("DL3C0001"))
        .await
        .unwrap();

    let snap = engine.try_record_snapshot().await.unwrap();
    assert_eq!(snap.occupied_count, 1);
    assert_eq!(snap.total_slots, 4);
    assert_eq!(snap.occupancy_rate, 25);
    assert_eq!(snap.hour_of_day, 9);
    assert_eq!(snap.day_of_week, 1);
}

#[tokio::test]
async fn bucket_switches_to_history_at_three_samples() {
    let (engine, clock, _) = lot("fallback_threshold.wal", 10).await;
    let monday_9 = PredictionQuery {
        hour: Some(9),
        day: Some(1),
        force_fallback: false,
    };

    engine.try_record_snapshot().await.unwrap();
    clock.advance(DAY_MS); // Tuesday, other bucket
    engine.try_record_snapshot().await.unwrap();
    clock.advance(6 * DAY_MS); // next Monday 09:00
    engine.try_record_snapshot().await.unwrap();

    let p = engine.predict(monday_9).await.unwrap();
    assert_eq!(p.method, PredictionMethod::FallbackLast3);
    assert!(p.is_fallback());
    assert_eq!(p.estimate.confidence, 40);

    clock.advance(7 * DAY_MS);
    engine.try_record_snapshot().await.unwrap();
    let p = engine.predict(monday_9).await.unwrap();
    assert_eq!(p.method, PredictionMethod::HistoricalAverage);
    assert_eq!(p.estimate.sample_count, 3);
    assert_eq!(p.estimate.confidence, 66);

    let forced = engine
        .predict(PredictionQuery {
            force_fallback: true,
            ..monday_9
        })
        .await
        .unwrap();
    assert_eq!(forced.method, PredictionMethod::FallbackLast3);
}

#[test]
fn confidence_never_decreases_and_caps() {
    let bucket = Bucket { hour: 9, day: 1 };
    let mut log = SnapshotLog::default();
    let mut last = 0;
    for n in 0..=20u32 {
        let confidence = select_estimate(&log, bucket, false).1.confidence;
        assert!(confidence >= last, "n={n}: {confidence} < {last}");
        assert!(confidence <= 95);
        if n == 0 {
            assert_eq!(confidence, 10);
        }
        if n == 20 {
            assert_eq!(confidence, 95);
        }
        last = confidence;
        log.push(OccupancySnapshot::new(0, bucket, 5, 10));
    }
}

#[tokio::test]
async fn empty_history_predicts_neutral_then_recency() {
    let (engine, _clock, _) = lot("scenario_neutral.wal", 20).await;

    let p = engine.predict(PredictionQuery::default()).await.unwrap();
    assert_eq!(p.estimate.predicted_rate, 50);
    assert_eq!(p.estimate.confidence, 10);
    assert_eq!(p.estimate.sample_count, 0);
    assert_eq!(p.method, PredictionMethod::FallbackLast3);
    assert_eq!(p.predicted_occupied, 10);
    assert_eq!(p.bucket, Bucket { hour: 9, day: 1 });
    assert_eq!(p.current.total, 20);
    assert_eq!(p.peak_hours, &PEAK_HOURS);

    // Rates 40, 60, 50 in the current bucket.
    {
        let mut log = engine.snapshots.write().await;
        for occupied in [8, 12, 10] {
            log.push(OccupancySnapshot::new(MONDAY_9AM, Bucket { hour: 9, day: 1 }, occupied, 20));
        }
    }
    let forced = engine
        .predict(PredictionQuery {
            force_fallback: true,
            ..PredictionQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(forced.estimate.predicted_rate, 50);
    assert_eq!(forced.estimate.sample_count, 3);
    let historical = engine.predict(PredictionQuery::default()).await.unwrap();
    assert_eq!(historical.estimate.predicted_rate, 50);
    assert_eq!(historical.method, PredictionMethod::HistoricalAverage);
}

#[tokio::test]
async fn cancelled_booking_leaves_lot_very_low() {
    let (engine, _clock, _) = lot("scenario_very_low.wal", 20).await;
    let slot_a = slot_ids(&engine).await[0];

    let booking = engine.reserve(request(slot_a).hours(2)).await.unwrap();
    assert_eq!(booking.end_time, MONDAY_9AM + 2 * HOUR_MS);
    engine.cancel(booking.id).await.unwrap();

    let p = engine.predict(PredictionQuery::default()).await.unwrap();
    assert_eq!(p.estimate.predicted_rate, 0);
    assert_eq!(p.recommendation.level, RecommendationLevel::VeryLow);
    assert_eq!(
        p.recommendation.message,
        "Parking is mostly empty. Easy to find a spot."
    );
}

#[tokio::test]
async fn predict_validates_bucket() {
    let (engine, _clock, _) = lot("predict_validate.wal", 1).await;
    for (hour, day) in [(Some(24), None), (None, Some(7)), (Some(99), Some(9))] {
        assert!(matches!(
            engine
                .predict(PredictionQuery {
                    hour,
                    day,
                    force_fallback: false
                })
                .await,
            Err(EngineError::Validation(_))
        ));
    }
}

#[tokio::test]
async fn full_day_forecast_covers_every_hour() {
    let (engine, clock, _) = lot("forecast.wal", 10).await;
    let ids = slot_ids(&engine).await;
    for id in &ids[..9] {
        engine
            .update_status(*id, SlotStatus::Occupied, Some("V1"))
            .await
            .unwrap();
    }
    // The nine overrides above left 09:00 Monday with rates 10..=90.
    clock.set(MONDAY_9AM + 30 * 60_000);

    let forecast = engine.predict_full_day(false).await;
    assert_eq!(forecast.day_of_week, 1);
    assert_eq!(forecast.hours.len(), 24);
    for (i, h) in forecast.hours.iter().enumerate() {
        assert_eq!(usize::from(h.hour), i);
    }
    assert_eq!(forecast.hours[9].method, PredictionMethod::HistoricalAverage);
    assert_eq!(forecast.hours[9].predicted_rate, 50);
    // Other hours have no history and fall back to the last three: 70, 80, 90.
    assert_eq!(forecast.hours[3].method, PredictionMethod::FallbackLast3);
    assert_eq!(forecast.hours[3].predicted_rate, 80);

    let forced = engine.predict_full_day(true).await;
    assert!(
        forced
            .hours
            .iter()
            .all(|h| h.method == PredictionMethod::FallbackLast3 && h.predicted_rate == 80)
    );
}

// ── Admin views ──────────────────────────────────────────

#[tokio::test]
async fn list_bookings_newest_first() {
    let (engine, clock, _) = lot("list_bookings.wal", 3).await;
    let ids = slot_ids(&engine).await;
    let mut made = Vec::new();
    for id in &ids {
        made.push(engine.reserve(request(*id)).await.unwrap().id);
        clock.advance(60_000);
    }
    let listed: Vec<Ulid> = engine.list_bookings().into_iter().map(|b| b.id).collect();
    made.reverse();
    assert_eq!(listed, made);
}

#[tokio::test]
async fn dashboard_totals() {
    let (engine, clock, _) = lot("dashboard.wal", 4).await;
    let ids = slot_ids(&engine).await;

    let old = engine.reserve(request(ids[0])).await.unwrap();
    engine.cancel(old.id).await.unwrap();
    clock.advance(DAY_MS);
    engine.reserve(request(ids[1])).await.unwrap();
    engine
        .update_status(ids[2], SlotStatus::Occupied, Some("DL3C0001"))
        .await
        .unwrap();

    let d = engine.dashboard().await;
    assert_eq!(d.slots.total, 4);
    assert_eq!(d.slots.reserved, 1);
    assert_eq!(d.slots.occupied, 1);
    assert_eq!(d.slots.available, 2);
    assert_eq!(d.slots.occupancy_rate, 25);
    assert_eq!(
        d.bookings,
        BookingTotals {
            total: 2,
            active: 1,
            today: 1
        }
    );
    // Four snapshots, all at 09:00: 0, 0, 0, 25.
    assert_eq!(
        d.hourly_averages,
        vec![HourlyAverage {
            hour_of_day: 9,
            avg_rate: 6.3
        }]
    );
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let (engine, clock, path) = lot("replay.wal", 5).await;
    let ids = slot_ids(&engine).await;

    let kept = engine.reserve(request(ids[0])).await.unwrap();
    let dropped = engine.reserve(request(ids[1])).await.unwrap();
    engine.cancel(dropped.id).await.unwrap();
    engine.force_maintenance(ids[2]).await.unwrap();
    engine
        .update_status(ids[3], SlotStatus::Occupied, Some("DL3C0001"))
        .await
        .unwrap();

    let slots = engine.list_slots().await;
    let bookings = engine.list_bookings();
    let snapshots = engine.snapshot_count().await;
    drop(engine);

    let engine = open(&path, clock, EngineOptions::default());
    assert_eq!(engine.list_slots().await, slots);
    assert_eq!(engine.list_bookings(), bookings);
    assert_eq!(engine.snapshot_count().await, snapshots);
    assert!(engine.get_booking(kept.id).unwrap().is_active());
    assert_consistent(&engine).await;

    // The restored row lock still guards the slot.
    assert!(matches!(
        engine.reserve(request(ids[0])).await,
        Err(EngineError::Conflict(_))
    ));
    assert_ok!(engine.cancel(kept.id).await);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, clock, path) = lot("compact.wal", 6).await;
    let ids = slot_ids(&engine).await;

    let a = engine.reserve(request(ids[0])).await.unwrap();
    let b = engine.reserve(request(ids[1])).await.unwrap();
    engine.cancel(a.id).await.unwrap();
    let c = engine.reserve(request(ids[0])).await.unwrap();
    engine
        .update_status(ids[1], SlotStatus::Occupied, Some("KA01AB1234"))
        .await
        .unwrap();
    engine.force_maintenance(ids[2]).await.unwrap();
    engine
        .update_status(ids[3], SlotStatus::Occupied, Some("DL3C0001"))
        .await
        .unwrap();
    assert!(engine.wal_appends_since_compact().await > 0);

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    // Appends after compaction land in the new file.
    clock.advance(HOUR_MS);
    let d = engine.reserve(request(ids[4])).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 2);

    let slots = engine.list_slots().await;
    let bookings = engine.list_bookings();
    let hourly = engine.hourly_averages().await;
    let snapshots = engine.snapshot_count().await;
    drop(engine);

    let engine = open(&path, clock, EngineOptions::default());
    assert_eq!(engine.list_slots().await, slots);
    assert_eq!(engine.list_bookings(), bookings);
    assert_eq!(engine.hourly_averages().await, hourly);
    assert_eq!(engine.snapshot_count().await, snapshots);
    for (id, active) in [(a.id, false), (b.id, true), (c.id, true), (d.id, true)] {
        assert_eq!(engine.get_booking(id).unwrap().is_active(), active);
    }
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn compaction_folds_finished_bookings() {
    let (engine, clock, path) = lot("compact_fold.wal", 2).await;
    let id = slot_ids(&engine).await[0];
    for _ in 0..20 {
        let booking = engine.reserve(request(id)).await.unwrap();
        clock.advance(60_000);
        engine.cancel(booking.id).await.unwrap();
    }
    let before = std::fs::metadata(&path).unwrap().len();

    engine.compact_wal().await.unwrap();
    // 2 slots, 20 archived bookings, 2 pins, 40 snapshots.
    assert_eq!(Wal::replay(&path).unwrap().events.len(), 64);
    assert!(std::fs::metadata(&path).unwrap().len() < before);

    let bookings = engine.list_bookings();
    drop(engine);
    let engine = open(&path, clock, EngineOptions::default());
    assert_eq!(engine.list_bookings(), bookings);
    assert_eq!(engine.snapshot_count().await, 40);
    assert_eq!(engine.get_slot(id).await.unwrap().status, SlotStatus::Available);
}

#[tokio::test]
async fn compaction_takes_no_row_lock() {
    let (engine, _clock, _) = lot("compact_unlocked.wal", 2).await;
    let ids = slot_ids(&engine).await;
    engine.reserve(request(ids[1])).await.unwrap();

    let _held = engine
        .store
        .lock(ids[0], Duration::from_secs(1))
        .await
        .unwrap();
    let compacted = tokio::time::timeout(Duration::from_secs(5), engine.compact_wal()).await;
    assert_ok!(assert_ok!(compacted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commits_during_compaction_survive_reopen() {
    let (engine, clock, path) = lot("compact_concurrent.wal", 12).await;
    let engine = Arc::new(engine);
    let ids = slot_ids(&engine).await;
    for id in &ids[..6] {
        let booking = engine.reserve(request(*id)).await.unwrap();
        engine.cancel(booking.id).await.unwrap();
    }

    let mut tasks = Vec::new();
    for id in ids.clone() {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.reserve(request(id)).await }));
    }
    let (first, second) = tokio::join!(engine.compact_wal(), engine.compact_wal());
    assert_ok!(first);
    assert_ok!(second);
    for task in tasks {
        assert_ok!(task.await.unwrap());
    }
    // Whatever landed after the fold started is carried into the new file.
    assert_ok!(engine.compact_wal().await);

    let slots = engine.list_slots().await;
    let bookings = engine.list_bookings();
    let snapshots = engine.snapshot_count().await;
    assert_eq!(bookings.iter().filter(|b| b.is_active()).count(), 12);
    drop(engine);

    let engine = open(&path, clock, EngineOptions::default());
    assert_eq!(engine.list_slots().await, slots);
    assert_eq!(engine.list_bookings(), bookings);
    assert_eq!(engine.snapshot_count().await, snapshots);
    assert_consistent(&engine).await;
}

// ── Storage faults ───────────────────────────────────────

fn is_reservation(event: &Event) -> bool {
    matches!(event, Event::SlotReserved { .. })
}

fn is_snapshot(event: &Event) -> bool {
    matches!(event, Event::SnapshotRecorded(_))
}

#[tokio::test]
async fn failed_reserve_commits_nothing() {
    let (engine, clock, path) = lot("fault_reserve.wal", 2).await;
    let id = slot_ids(&engine).await[0];

    engine.fail_wal_batches(is_reservation, 1).await;
    let err = assert_err!(engine.reserve(request(id)).await);
    assert!(matches!(err, EngineError::Storage(_)), "{err}");
    assert_eq!(engine.get_slot(id).await.unwrap().status, SlotStatus::Available);
    assert!(engine.list_bookings().is_empty());
    assert_eq!(engine.snapshot_count().await, 0);

    // The log is usable again and the failed record never reached it.
    let booking = assert_ok!(engine.reserve(request(id)).await);
    drop(engine);
    let engine = open(&path, clock, EngineOptions::default());
    assert_eq!(engine.list_bookings(), vec![booking]);
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn failed_cancel_keeps_booking() {
    let (engine, _clock, _) = lot("fault_cancel.wal", 1).await;
    let id = slot_ids(&engine).await[0];
    let booking = engine.reserve(request(id)).await.unwrap();

    engine
        .fail_wal_batches(|e| matches!(e, Event::BookingCancelled { .. }), 1)
        .await;
    assert!(matches!(
        engine.cancel(booking.id).await,
        Err(EngineError::Storage(_))
    ));
    assert!(engine.get_booking(booking.id).unwrap().is_active());
    assert_eq!(engine.get_slot(id).await.unwrap().status, SlotStatus::Reserved);

    assert_ok!(engine.cancel(booking.id).await);
    assert_consistent(&engine).await;
}

#[tokio::test]
async fn snapshot_failure_leaves_reserve_committed() {
    let (engine, _clock, _) = lot("fault_snapshot.wal", 2).await;
    let ids = slot_ids(&engine).await;

    engine.fail_wal_batches(is_snapshot, 1).await;
    assert!(matches!(
        engine.try_record_snapshot().await,
        Err(TelemetryError::Storage(_))
    ));

    engine.fail_wal_batches(is_snapshot, 1).await;
    let booking = assert_ok!(engine.reserve(request(ids[0])).await);
    assert_eq!(engine.snapshot_count().await, 0);
    assert_eq!(engine.get_slot(ids[0]).await.unwrap().status, SlotStatus::Reserved);
    assert!(engine.get_booking(booking.id).unwrap().is_active());

    // Faults are spent; the next snapshot lands.
    assert_ok!(engine.try_record_snapshot().await);
    assert_eq!(engine.snapshot_count().await, 1);
}
