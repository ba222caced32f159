//! Core domain types shared across the control core (spec §3).
//!
//! The original control logic dispatched on a `device_type` string; per the
//! REDESIGN FLAG in spec §9 this is replaced with a closed tagged variant so
//! the compiler enforces exhaustive handling at every call site that cares
//! about device semantics (PID vs. hysteresis eligibility, interlock
//! defaults, dimmability).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A `(location, cluster)` pair naming a controlled space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId {
    pub location: String,
    pub cluster: String,
}

impl ZoneId {
    pub fn new(location: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            cluster: cluster.into(),
        }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location, self.cluster)
    }
}

/// A device identifier within a zone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub zone: ZoneId,
    pub name: String,
}

impl DeviceId {
    pub fn new(zone: ZoneId, name: impl Into<String>) -> Self {
        Self {
            zone,
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone, self.name)
    }
}

/// Closed tagged variant replacing string comparisons on `device_type`
/// (spec §9 REDESIGN FLAGS). Dispatch on this tag plus `pid_enabled`
/// decides PID vs. hysteresis control (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "device_type")]
pub enum DeviceKind {
    Heater,
    Fan { cooling: bool },
    ExhaustFan,
    Dehumidifier,
    Humidifier,
    Co2,
    Light { dimmable: bool },
}

impl DeviceKind {
    /// Lights are never PID-controlled (spec §3 invariant).
    pub fn can_pid(self) -> bool {
        !matches!(self, DeviceKind::Light { .. })
    }

    /// Hysteresis-eligible kinds per spec §4.6 (used only when `pid_enabled`
    /// is false and the kind is not a light).
    pub fn uses_hysteresis(self) -> bool {
        matches!(
            self,
            DeviceKind::Dehumidifier | DeviceKind::Humidifier | DeviceKind::Fan { .. }
        )
    }

    pub fn is_dimmable(self) -> bool {
        matches!(self, DeviceKind::Light { dimmable: true })
    }

    pub fn is_light(self) -> bool {
        matches!(self, DeviceKind::Light { .. })
    }

    /// The `device_type` label this kind was parsed from (spec §6),
    /// used to key the PID parameter cache and `pid_limits` config.
    pub fn type_label(self) -> &'static str {
        match self {
            DeviceKind::Heater => "heater",
            DeviceKind::Fan { .. } => "fan",
            DeviceKind::ExhaustFan => "exhaust_fan",
            DeviceKind::Dehumidifier => "dehumidifier",
            DeviceKind::Humidifier => "humidifier",
            DeviceKind::Co2 => "co2",
            DeviceKind::Light { .. } => "light",
        }
    }
}

/// `OFF` / `ON` / restore the last persisted value on restart (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeState {
    Off,
    On,
    LastKnown,
}

/// Which relay expander board a channel lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardId(pub String);

/// Optional dimming descriptor: present iff the device is dimmable
/// (spec §3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimmingDescriptor {
    pub board_id: BoardId,
    pub dac_channel: u8,
}

/// A setpoint kind a PID-driven device can be keyed against, with the
/// priority used for multi-setpoint arbitration (spec §4.3).
pub type SetpointPriorities = BTreeMap<SetpointKind, u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetpointKind {
    Heating,
    Cooling,
    Vpd,
    Co2,
}

/// Static device configuration (spec §3 `Device`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceKind,
    /// Relay channel (0–15) on `board`.
    pub channel: u8,
    pub board: BoardId,
    pub dimming: Option<DimmingDescriptor>,
    pub pid_enabled: bool,
    pub pid_setpoints: SetpointPriorities,
    pub pwm_period_seconds: u32,
    pub interlock_with: Vec<String>,
    /// Whether this device wins any interlock pair it's named in
    /// (spec §4.7: "the winner is configurable"). Defaults to `false`,
    /// in which case the interlock manager falls back to the default
    /// heater-wins rule for that pair.
    pub interlock_priority: bool,
    pub safe_state: SafeState,
    /// Target intensity a dimmable light ramps to at full day (spec §4.4);
    /// `None` for non-light devices.
    pub light_target_intensity_pct: Option<f64>,
}

impl Device {
    /// Validates the structural invariants from spec §3 that are local to a
    /// single device (cross-device invariants like "channel owned by
    /// exactly one device" are checked by the config loader over the whole
    /// device set).
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if self.channel > 15 {
            return Err(ConfigError::Invalid {
                field: format!("devices.{}.channel", self.id),
                reason: format!("channel {} out of range 0-15", self.channel),
            });
        }
        let dimmable = self.kind.is_dimmable();
        if dimmable && self.dimming.is_none() {
            return Err(ConfigError::Invalid {
                field: format!("devices.{}.dimming", self.id),
                reason: "dimmable device is missing a dimming descriptor".into(),
            });
        }
        if !dimmable && self.dimming.is_some() {
            return Err(ConfigError::Invalid {
                field: format!("devices.{}.dimming", self.id),
                reason: "non-dimmable device must not have a dimming descriptor".into(),
            });
        }
        if self.kind.is_light() && self.pid_enabled {
            return Err(ConfigError::Invalid {
                field: format!("devices.{}.pid_enabled", self.id),
                reason: "light devices never participate in PID".into(),
            });
        }
        Ok(())
    }
}

/// The categorical label attributed to every device command (spec glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Rule,
    Schedule,
    Pid,
    Photoperiod,
    Manual,
    Interlock,
    Failsafe,
    Startup,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Rule => "rule",
            Reason::Schedule => "schedule",
            Reason::Pid => "pid",
            Reason::Photoperiod => "photoperiod",
            Reason::Manual => "manual",
            Reason::Interlock => "interlock",
            Reason::Failsafe => "failsafe",
            Reason::Startup => "startup",
        };
        f.write_str(s)
    }
}

/// Per-device runtime mode (spec §3 `DeviceState.mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    Manual,
    Auto,
    Scheduled,
}

/// Zone-level automation mode (spec §3 `ZoneMode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneMode {
    Auto,
    Manual,
    Override,
    Failsafe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_never_pids() {
        assert!(!DeviceKind::Light { dimmable: true }.can_pid());
        assert!(DeviceKind::Heater.can_pid());
    }

    #[test]
    fn dimmable_descriptor_required() {
        let dev = Device {
            id: DeviceId::new(ZoneId::new("Flower", "front"), "light_1"),
            kind: DeviceKind::Light { dimmable: true },
            channel: 3,
            board: BoardId("board_a".into()),
            dimming: None,
            pid_enabled: false,
            pid_setpoints: Default::default(),
            pwm_period_seconds: 100,
            interlock_with: vec![],
            interlock_priority: false,
            safe_state: SafeState::Off,
            light_target_intensity_pct: None,
        };
        assert!(dev.validate().is_err());
    }

    #[test]
    fn light_rejects_pid_enabled() {
        let dev = Device {
            id: DeviceId::new(ZoneId::new("Flower", "front"), "light_1"),
            kind: DeviceKind::Light { dimmable: false },
            channel: 3,
            board: BoardId("board_a".into()),
            dimming: None,
            pid_enabled: true,
            pid_setpoints: Default::default(),
            pwm_period_seconds: 100,
            interlock_with: vec![],
            interlock_priority: false,
            safe_state: SafeState::Off,
            light_target_intensity_pct: None,
        };
        assert!(dev.validate().is_err());
    }
}
