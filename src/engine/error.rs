use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Caller input is missing or malformed. Never worth retrying as-is.
    Validation(String),
    AlreadyExists(Ulid),
    /// Slot is not available, or the booking is no longer active on it.
    Conflict(Ulid),
    NotFound(Ulid),
    /// Gave up waiting for a contended slot. Nothing was written.
    Timeout(Ulid),
    /// The log could not be written. Nothing was committed; safe to retry.
    Storage(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "slot not available: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Timeout(id) => write!(f, "timed out waiting for slot: {id}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Failure to append an occupancy snapshot. Logged and dropped, never returned
/// from a booking operation.
#[derive(Debug)]
pub enum TelemetryError {
    /// No slots exist, so there is no rate to record.
    EmptyLot,
    Storage(String),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryError::EmptyLot => write!(f, "no slots to measure"),
            TelemetryError::Storage(e) => write!(f, "snapshot append failed: {e}"),
        }
    }
}

impl std::error::Error for TelemetryError {}
