use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkd_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (reserved, conflict, invalid, not_found, timeout, storage).
pub const RESERVATIONS_TOTAL: &str = "parkd_reservations_total";

/// Counter: successful cancellations.
pub const CANCELLATIONS_TOTAL: &str = "parkd_cancellations_total";

/// Histogram: time spent waiting for a slot's row lock, in seconds.
pub const SLOT_LOCK_WAIT_SECONDS: &str = "parkd_slot_lock_wait_seconds";

// ── Telemetry / prediction ──────────────────────────────────────

/// Counter: occupancy snapshots appended.
pub const SNAPSHOTS_RECORDED_TOTAL: &str = "parkd_snapshots_recorded_total";

/// Counter: snapshot appends that failed and were dropped.
pub const SNAPSHOT_FAILURES_TOTAL: &str = "parkd_snapshot_failures_total";

/// Counter: predictions served. Labels: method.
pub const PREDICTIONS_TOTAL: &str = "parkd_predictions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "parkd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        tracing::error!("failed to install Prometheus exporter on :{port}: {e}");
        return;
    }
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSlot { .. } => "insert_slot",
        Command::Reserve { .. } => "reserve",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::ForceMaintenance { .. } => "force_maintenance",
        Command::SetSlotStatus { .. } => "set_slot_status",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings => "select_bookings",
        Command::SelectPrediction { .. } => "select_prediction",
        Command::SelectForecast { .. } => "select_forecast",
        Command::SelectDashboard => "select_dashboard",
        Command::SelectHourlyAverages => "select_hourly_averages",
        Command::SelectFloors => "select_floors",
    }
}
