//! Error taxonomy for the control core (spec §7).
//!
//! Component boundaries return one of these `thiserror` enums so callers can
//! match on error *kind*, not string content. Unexpected failures at process
//! boundaries (main, background tasks) are wrapped in `anyhow::Error`
//! instead — see `main.rs`.

use std::ops::RangeInclusive;

/// Raised when the startup configuration fails validation. Blocks startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("config field {field} is invalid: {reason}")]
    Invalid { field: String, reason: String },
}

/// A rejected mutating API call (spec §6/§7: field, value, allowed range).
#[derive(Debug, thiserror::Error)]
#[error("validation failed for field {field}: {value} is outside allowed range [{}, {}]", .allowed_range.start(), .allowed_range.end())]
pub struct ValidationError {
    pub field: String,
    pub value: f64,
    pub allowed_range: RangeInclusive<f64>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, value: f64, allowed_range: RangeInclusive<f64>) -> Self {
        Self {
            field: field.into(),
            value,
            allowed_range,
        }
    }
}

/// Errors from the hardware bus (I2C relay expander / DAC).
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("transient I/O error on channel {channel}: {message}")]
    Transient { channel: u8, message: String },
    #[error("persistent fault on channel {channel} after {attempts} attempts: {message}")]
    PersistentFault {
        channel: u8,
        attempts: u32,
        message: String,
    },
    #[error("bus transaction exceeded deadline of {deadline_ms} ms")]
    Timeout { deadline_ms: u64 },
}

/// Errors talking to the real-time state bus (Redis-shaped contract).
#[derive(Debug, thiserror::Error)]
pub enum StateBusError {
    #[error("state bus unreachable: {0}")]
    Unreachable(String),
    #[error("state bus call exceeded deadline of {deadline_ms} ms")]
    Timeout { deadline_ms: u64 },
}

/// Errors talking to the persistent time-series/relational store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence store unreachable: {0}")]
    Unreachable(String),
    #[error("persistence buffer full, dropping oldest record")]
    BufferFull,
}

/// Errors surfaced by the per-tick control engine. Most conditions named in
/// spec §7 are handled locally and only logged; this enum covers what the
/// engine itself cannot recover from for a single zone.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("zone {zone} has no configured devices")]
    EmptyZone { zone: String },
    #[error("interlock resolution did not converge for zone {zone} after {passes} passes")]
    InterlockCycle { zone: String, passes: u8 },
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    StateBus(#[from] StateBusError),
}
