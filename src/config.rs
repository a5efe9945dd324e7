use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineOptions;

/// Process configuration, read once from `PARKD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub utc_offset_minutes: i32,
    pub lock_timeout_ms: u64,
    pub seed_floors: u32,
    pub seed_slots_per_floor: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(&format!("PARKD_{key}"));
        Self {
            port: parsed(get("PORT")).unwrap_or(5433),
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: get("PASSWORD").unwrap_or_else(|| "parkd".into()),
            max_connections: parsed(get("MAX_CONNECTIONS")).unwrap_or(256),
            compact_threshold: parsed(get("COMPACT_THRESHOLD")).unwrap_or(1000),
            metrics_port: parsed(get("METRICS_PORT")),
            utc_offset_minutes: parsed(get("UTC_OFFSET_MINUTES"))
                .filter(|m: &i32| m.abs() <= 14 * 60)
                .unwrap_or(0),
            lock_timeout_ms: parsed(get("LOCK_TIMEOUT_MS")).unwrap_or(5000),
            seed_floors: parsed(get("SEED_FLOORS")).unwrap_or(2),
            seed_slots_per_floor: parsed(get("SEED_SLOTS_PER_FLOOR")).unwrap_or(10),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkd.wal")
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            utc_offset_minutes: self.utc_offset_minutes,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|s| s.trim().parse().ok())
}
