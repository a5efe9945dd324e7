use std::collections::HashMap;

use tracing::{debug, warn};

use crate::model::*;
use crate::observability::{SNAPSHOTS_RECORDED_TOTAL, SNAPSHOT_FAILURES_TOTAL};

use super::{Engine, EngineError, TelemetryError};

/// Running totals for one (hour, weekday) bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketTotals {
    pub samples: u32,
    pub rate_sum: u64,
}

impl BucketTotals {
    pub fn mean(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.rate_sum as f64 / f64::from(self.samples))
    }
}

/// Append-only occupancy history, in recording order, with per-bucket totals
/// kept alongside so bucket lookups never scan the log.
#[derive(Debug, Default)]
pub struct SnapshotLog {
    entries: Vec<OccupancySnapshot>,
    buckets: HashMap<Bucket, BucketTotals>,
}

impl SnapshotLog {
    pub fn push(&mut self, snapshot: OccupancySnapshot) {
        let totals = self.buckets.entry(snapshot.bucket()).or_default();
        totals.samples += 1;
        totals.rate_sum += u64::from(snapshot.occupancy_rate);
        self.entries.push(snapshot);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[OccupancySnapshot] {
        &self.entries
    }

    pub fn bucket(&self, bucket: Bucket) -> BucketTotals {
        self.buckets.get(&bucket).copied().unwrap_or_default()
    }

    /// The `n` most recently recorded snapshots, oldest first.
    pub fn latest(&self, n: usize) -> &[OccupancySnapshot] {
        &self.entries[self.entries.len().saturating_sub(n)..]
    }

    /// Mean rate per hour of day across all weekdays, rounded to one decimal.
    /// Hours with no samples are omitted.
    pub fn hourly_averages(&self) -> Vec<HourlyAverage> {
        let mut by_hour = [BucketTotals::default(); 24];
        for (bucket, totals) in &self.buckets {
            let h = &mut by_hour[usize::from(bucket.hour)];
            h.samples += totals.samples;
            h.rate_sum += totals.rate_sum;
        }
        by_hour
            .iter()
            .enumerate()
            .filter_map(|(hour, totals)| {
                totals.mean().map(|avg| HourlyAverage {
                    hour_of_day: hour as u8,
                    avg_rate: (avg * 10.0).round() / 10.0,
                })
            })
            .collect()
    }
}

impl Engine {
    /// Measure the lot and append one snapshot to the history.
    ///
    /// The log's write lock is held across the WAL append, so snapshots land
    /// in the log in the same order they land in the WAL.
    pub async fn try_record_snapshot(&self) -> Result<OccupancySnapshot, TelemetryError> {
        let stats = self.store.counts().await;
        if stats.total == 0 {
            return Err(TelemetryError::EmptyLot);
        }
        let now = self.now();
        let snapshot = OccupancySnapshot::new(
            now,
            Bucket::at(now, self.options.utc_offset_minutes),
            stats.occupied,
            stats.total,
        );

        let mut log = self.snapshots.write().await;
        self.wal_append(&Event::SnapshotRecorded(snapshot))
            .await
            .map_err(|e| match e {
                EngineError::Storage(msg) => TelemetryError::Storage(msg),
                other => TelemetryError::Storage(other.to_string()),
            })?;
        log.push(snapshot);
        metrics::counter!(SNAPSHOTS_RECORDED_TOTAL).increment(1);
        debug!(
            rate = snapshot.occupancy_rate,
            hour = snapshot.hour_of_day,
            day = snapshot.day_of_week,
            "snapshot recorded"
        );
        Ok(snapshot)
    }

    /// Record a snapshot after a committed transaction. Failures are logged
    /// and counted; the transaction that triggered it has already succeeded.
    pub async fn record_snapshot(&self) -> Option<OccupancySnapshot> {
        match self.try_record_snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                metrics::counter!(SNAPSHOT_FAILURES_TOTAL).increment(1);
                warn!("occupancy snapshot dropped: {e}");
                None
            }
        }
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn hourly_averages(&self) -> Vec<HourlyAverage> {
        self.snapshots.read().await.hourly_averages()
    }
}
