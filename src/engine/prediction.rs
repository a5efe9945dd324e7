use crate::limits::{FALLBACK_WINDOW, MIN_HISTORICAL_SAMPLES};
use crate::model::*;
use crate::observability::PREDICTIONS_TOTAL;

use super::{Engine, EngineError, SnapshotLog};

/// Hours the lot is usually busiest, reported with every prediction.
pub const PEAK_HOURS: [u8; 6] = [8, 9, 10, 17, 18, 19];

/// What a model says about one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub predicted_rate: u32,
    pub sample_count: u32,
    pub confidence: u32,
}

impl Estimate {
    /// Returned when there is no history at all.
    pub const NEUTRAL: Estimate = Estimate {
        predicted_rate: 50,
        sample_count: 0,
        confidence: 10,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionMethod {
    HistoricalAverage,
    FallbackLast3,
}

impl PredictionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionMethod::HistoricalAverage => "historical_average",
            PredictionMethod::FallbackLast3 => "fallback_last3",
        }
    }
}

fn mean_rate(rate_sum: u64, samples: usize) -> u32 {
    (rate_sum as f64 / samples as f64).round() as u32
}

/// Mean rate of every snapshot in `bucket`. `None` when the bucket is empty.
pub fn historical_average(log: &SnapshotLog, bucket: Bucket) -> Option<Estimate> {
    let totals = log.bucket(bucket);
    if totals.samples == 0 {
        return None;
    }
    Some(Estimate {
        predicted_rate: mean_rate(totals.rate_sum, totals.samples as usize),
        sample_count: totals.samples,
        confidence: (60 + 2 * totals.samples).min(95),
    })
}

/// Mean rate of the most recently recorded snapshots, whatever their bucket.
pub fn recency_average(log: &SnapshotLog) -> Estimate {
    let recent = log.latest(FALLBACK_WINDOW);
    if recent.is_empty() {
        return Estimate::NEUTRAL;
    }
    let sum: u64 = recent.iter().map(|s| u64::from(s.occupancy_rate)).sum();
    Estimate {
        predicted_rate: mean_rate(sum, recent.len()),
        sample_count: recent.len() as u32,
        confidence: 40,
    }
}

/// Historical average when the bucket has enough samples and the caller did
/// not ask for the fallback; recency average otherwise.
pub fn select_estimate(
    log: &SnapshotLog,
    bucket: Bucket,
    force_fallback: bool,
) -> (PredictionMethod, Estimate) {
    if !force_fallback
        && let Some(est) = historical_average(log, bucket)
        && est.sample_count >= MIN_HISTORICAL_SAMPLES
    {
        return (PredictionMethod::HistoricalAverage, est);
    }
    (PredictionMethod::FallbackLast3, recency_average(log))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl RecommendationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationLevel::High => "high",
            RecommendationLevel::Medium => "medium",
            RecommendationLevel::Low => "low",
            RecommendationLevel::VeryLow => "very_low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recommendation {
    pub level: RecommendationLevel,
    pub message: &'static str,
}

pub fn recommend(rate: u32) -> Recommendation {
    let (level, message) = match rate {
        90.. => (
            RecommendationLevel::High,
            "Parking is nearly full. Book immediately!",
        ),
        70..=89 => (
            RecommendationLevel::Medium,
            "Limited spots available. Book soon.",
        ),
        40..=69 => (
            RecommendationLevel::Low,
            "Good availability. Plenty of spots.",
        ),
        _ => (
            RecommendationLevel::VeryLow,
            "Parking is mostly empty. Easy to find a spot.",
        ),
    };
    Recommendation { level, message }
}

/// Which bucket to predict. Unset fields default to the current local hour
/// and weekday.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionQuery {
    pub hour: Option<u8>,
    pub day: Option<u8>,
    pub force_fallback: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub bucket: Bucket,
    pub method: PredictionMethod,
    pub estimate: Estimate,
    /// The estimate applied to the live slot total.
    pub predicted_occupied: u32,
    pub current: OccupancyStats,
    pub recommendation: Recommendation,
    pub peak_hours: &'static [u8],
}

impl Prediction {
    pub fn is_fallback(&self) -> bool {
        self.method == PredictionMethod::FallbackLast3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyForecast {
    pub hour: u8,
    pub predicted_rate: u32,
    pub method: PredictionMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayForecast {
    pub day_of_week: u8,
    pub hours: Vec<HourlyForecast>,
}

impl Engine {
    pub async fn predict(&self, query: PredictionQuery) -> Result<Prediction, EngineError> {
        let now = self.current_bucket();
        let hour = query.hour.unwrap_or(now.hour);
        let day = query.day.unwrap_or(now.day);
        if hour > 23 {
            return Err(EngineError::validation(format!("hour must be 0-23, got {hour}")));
        }
        let bucket = Bucket::new(hour, day)
            .ok_or_else(|| EngineError::validation(format!("day must be 0-6, got {day}")))?;

        let (method, estimate) = {
            let log = self.snapshots.read().await;
            select_estimate(&log, bucket, query.force_fallback)
        };
        let current = self.store.counts().await;
        let predicted_occupied =
            (f64::from(estimate.predicted_rate) / 100.0 * f64::from(current.total)).round() as u32;

        metrics::counter!(PREDICTIONS_TOTAL, "method" => method.as_str()).increment(1);
        Ok(Prediction {
            bucket,
            method,
            estimate,
            predicted_occupied,
            current,
            recommendation: recommend(estimate.predicted_rate),
            peak_hours: &PEAK_HOURS,
        })
    }

    /// One estimate per hour of the current local weekday.
    pub async fn predict_full_day(&self, force_fallback: bool) -> DayForecast {
        let day = self.current_bucket().day;
        let log = self.snapshots.read().await;
        let hours = (0..24u8)
            .map(|hour| {
                let (method, est) = select_estimate(&log, Bucket { hour, day }, force_fallback);
                HourlyForecast {
                    hour,
                    predicted_rate: est.predicted_rate,
                    method,
                }
            })
            .collect();
        DayForecast {
            day_of_week: day,
            hours,
        }
    }
}
