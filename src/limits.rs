//! Hard input limits. Anything beyond these is rejected as a validation error.

pub const MAX_SLOTS: usize = 10_000;
pub const MAX_SLOT_NUMBER_LEN: usize = 16;

pub const MAX_USER_NAME_LEN: usize = 128;
pub const MAX_USER_PHONE_LEN: usize = 32;
pub const MAX_VEHICLE_NUMBER_LEN: usize = 16;

pub const DEFAULT_DURATION_HOURS: u32 = 2;
pub const MAX_DURATION_HOURS: u32 = 72;

/// Rows returned by a booking listing, newest first.
pub const MAX_BOOKINGS_LISTED: usize = 100;

/// Snapshots averaged by the recency fallback.
pub const FALLBACK_WINDOW: usize = 3;
/// Bucket samples needed before the historical model is trusted.
pub const MIN_HISTORICAL_SAMPLES: u32 = 3;

pub const MAX_SEED_FLOORS: u32 = 26;
