//! Two-point hysteresis controller (spec §4.6).
//!
//! Two-point (on/off) control for the devices that don't run PID: a
//! non-PID cooling fan (temperature-driven), the dehumidifier and
//! humidifier (both VPD-driven, in opposite directions). A missing or
//! stale sensor reading leaves the device's last commanded state
//! unchanged rather than guessing.

use std::collections::HashMap;

use crate::domain::DeviceId;

pub const DEFAULT_DEADBAND_FRACTION: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HysteresisDirection {
    /// Turns on as the value rises above the setpoint (cooling fan).
    RisingTurnsOn,
    /// Turns on as the value falls below the setpoint (dehumidifier,
    /// since a low VPD means the air is too humid).
    FallingTurnsOn,
}

/// One two-point loop's tuning: `deadband` is a half-width around
/// `setpoint`, defaulting to `DEFAULT_DEADBAND_FRACTION * setpoint.abs()`
/// when not overridden.
#[derive(Debug, Clone, Copy)]
pub struct HysteresisParameters {
    pub setpoint: f64,
    pub deadband: f64,
    pub direction: HysteresisDirection,
}

impl HysteresisParameters {
    pub fn new(setpoint: f64, direction: HysteresisDirection) -> Self {
        Self {
            setpoint,
            deadband: DEFAULT_DEADBAND_FRACTION * setpoint.abs(),
            direction,
        }
    }

    fn next_state(&self, current: bool, value: f64) -> bool {
        let upper = self.setpoint + self.deadband;
        let lower = self.setpoint - self.deadband;
        match self.direction {
            HysteresisDirection::RisingTurnsOn => {
                if value > upper {
                    true
                } else if value < lower {
                    false
                } else {
                    current
                }
            }
            HysteresisDirection::FallingTurnsOn => {
                if value < lower {
                    true
                } else if value > upper {
                    false
                } else {
                    current
                }
            }
        }
    }
}

/// Tracks last-commanded on/off state per device so each tick's decision
/// is relative to where the loop already was, which is what makes it
/// hysteresis rather than a stateless threshold.
#[derive(Default)]
pub struct HysteresisBank {
    last_state: HashMap<DeviceId, bool>,
}

impl HysteresisBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_state(&self, device: &DeviceId) -> bool {
        self.last_state.get(device).copied().unwrap_or(false)
    }

    /// `value = None` means the driving sensor is missing or stale: the
    /// device holds its last state (spec §4.6 edge case) and no update is
    /// recorded.
    pub fn tick(&mut self, device: &DeviceId, params: &HysteresisParameters, value: Option<f64>) -> bool {
        let current = self.last_state(device);
        let Some(value) = value else {
            return current;
        };
        let next = params.next_state(current, value);
        self.last_state.insert(device.clone(), next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ZoneId;

    fn id() -> DeviceId {
        DeviceId::new(ZoneId::new("Veg", "a"), "dehu_1")
    }

    #[test]
    fn cooling_fan_rising_turns_on_then_holds_until_low_side() {
        let params = HysteresisParameters::new(26.0, HysteresisDirection::RisingTurnsOn);
        let mut bank = HysteresisBank::new();
        let device = id();
        assert!(!bank.tick(&device, &params, Some(26.3)));
        assert!(bank.tick(&device, &params, Some(27.5)));
        assert!(bank.tick(&device, &params, Some(26.3)));
        assert!(!bank.tick(&device, &params, Some(24.5)));
    }

    #[test]
    fn dehumidifier_falling_turns_on_when_too_humid() {
        let params = HysteresisParameters::new(1.0, HysteresisDirection::FallingTurnsOn);
        let mut bank = HysteresisBank::new();
        let device = id();
        assert!(bank.tick(&device, &params, Some(0.9)));
        assert!(bank.tick(&device, &params, Some(0.98)));
        assert!(!bank.tick(&device, &params, Some(1.1)));
    }

    #[test]
    fn missing_sensor_holds_last_state() {
        let params = HysteresisParameters::new(26.0, HysteresisDirection::RisingTurnsOn);
        let mut bank = HysteresisBank::new();
        let device = id();
        assert!(bank.tick(&device, &params, Some(27.5)));
        assert!(bank.tick(&device, &params, None));
    }
}
