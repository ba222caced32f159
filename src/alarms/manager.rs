//! C12 Alarm / Failsafe Manager (spec §4.9).
//!
//! Owns every `ZoneMode` transition into and out of `failsafe` (spec §3
//! ownership rule). Nothing else in the control core is permitted to flip
//! a zone's mode to or from `failsafe`.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::domain::{ZoneId, ZoneMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmName {
    SensorMissing,
    SensorLoss,
    HardwareFault,
    DbLoss,
    InterlockCycle,
    SetpointOutOfRange,
}

impl AlarmName {
    /// Alarms in this class force the owning zone into failsafe while
    /// active (spec §4.9: "sensor_loss and hardware_fault force the zone
    /// into failsafe").
    fn forces_failsafe(self) -> bool {
        matches!(self, AlarmName::SensorLoss | AlarmName::HardwareFault)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlarmName::SensorMissing => "sensor_missing",
            AlarmName::SensorLoss => "sensor_loss",
            AlarmName::HardwareFault => "hardware_fault",
            AlarmName::DbLoss => "db_loss",
            AlarmName::InterlockCycle => "interlock_cycle",
            AlarmName::SetpointOutOfRange => "setpoint_out_of_range",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alarm {
    pub zone: ZoneId,
    pub name: AlarmName,
    pub severity: Severity,
    pub message: String,
    pub raised_at: Instant,
    pub acknowledged_at: Option<Instant>,
}

struct ZoneFailsafeState {
    mode: ZoneMode,
    /// Alarm names currently holding this zone in failsafe. Cleared one
    /// at a time as their conditions resolve.
    active_triggers: HashSet<AlarmName>,
    /// When `active_triggers` last became empty, so `clear_hold` can be
    /// measured before auto-clearing (spec §4.9).
    conditions_clear_since: Option<Instant>,
}

impl Default for ZoneFailsafeState {
    fn default() -> Self {
        Self {
            mode: ZoneMode::Auto,
            active_triggers: HashSet::new(),
            conditions_clear_since: None,
        }
    }
}

pub struct AlarmManager {
    clear_hold: Duration,
    alarms: HashMap<(ZoneId, AlarmName), Alarm>,
    zones: HashMap<ZoneId, ZoneFailsafeState>,
}

impl AlarmManager {
    pub fn new(clear_hold: Duration) -> Self {
        Self {
            clear_hold,
            alarms: HashMap::new(),
            zones: HashMap::new(),
        }
    }

    pub fn zone_mode(&self, zone: &ZoneId) -> ZoneMode {
        self.zones.get(zone).map(|z| z.mode).unwrap_or(ZoneMode::Auto)
    }

    pub fn is_failsafe(&self, zone: &ZoneId) -> bool {
        self.zone_mode(zone) == ZoneMode::Failsafe
    }

    /// Raises or refreshes an alarm. Entering failsafe is the only side
    /// effect on `ZoneMode`; everything else is informational.
    pub fn raise(&mut self, zone: &ZoneId, name: AlarmName, severity: Severity, message: impl Into<String>, now: Instant) {
        let key = (zone.clone(), name);
        self.alarms
            .entry(key)
            .and_modify(|a| {
                a.severity = severity;
                a.message = message.into();
            })
            .or_insert_with(|| Alarm {
                zone: zone.clone(),
                name,
                severity,
                message: message.into(),
                raised_at: now,
                acknowledged_at: None,
            });

        if severity == Severity::Critical && name.forces_failsafe() {
            let zone_state = self.zones.entry(zone.clone()).or_default();
            zone_state.active_triggers.insert(name);
            zone_state.conditions_clear_since = None;
            if zone_state.mode != ZoneMode::Failsafe {
                tracing::warn!(zone = %zone, alarm = name.as_str(), "zone entering failsafe");
                zone_state.mode = ZoneMode::Failsafe;
            }
        }
    }

    /// Called when the condition behind a previously-raised alarm
    /// resolves (e.g. a fresh sensor read, a successful hardware apply).
    /// Removes the alarm and, if it was a failsafe trigger and no other
    /// trigger remains active, starts the `clear_hold` countdown.
    pub fn clear_condition(&mut self, zone: &ZoneId, name: AlarmName, now: Instant) {
        self.alarms.remove(&(zone.clone(), name));
        if !name.forces_failsafe() {
            return;
        }
        if let Some(zone_state) = self.zones.get_mut(zone) {
            zone_state.active_triggers.remove(&name);
            if zone_state.active_triggers.is_empty() && zone_state.conditions_clear_since.is_none() {
                zone_state.conditions_clear_since = Some(now);
            }
        }
    }

    pub fn acknowledge(&mut self, zone: &ZoneId, name: AlarmName, now: Instant) {
        if let Some(alarm) = self.alarms.get_mut(&(zone.clone(), name)) {
            alarm.acknowledged_at = Some(now);
        }
    }

    /// Advances automatic failsafe-clear logic for one zone; call once
    /// per tick. Clears failsafe back to auto once every trigger has been
    /// clear for `clear_hold` (spec §4.9, scenario 4).
    pub fn tick(&mut self, zone: &ZoneId, now: Instant) {
        let Some(zone_state) = self.zones.get_mut(zone) else {
            return;
        };
        if zone_state.mode != ZoneMode::Failsafe || !zone_state.active_triggers.is_empty() {
            return;
        }
        if let Some(since) = zone_state.conditions_clear_since {
            if now.duration_since(since) >= self.clear_hold {
                zone_state.mode = ZoneMode::Auto;
                zone_state.conditions_clear_since = None;
            }
        }
    }

    /// Manual clear via the operator API. Accepted only when no trigger
    /// is currently active (spec §6: "accepted only when conditions
    /// currently permit clearing").
    pub fn clear_failsafe(&mut self, zone: &ZoneId) -> Result<(), &'static str> {
        let Some(zone_state) = self.zones.get_mut(zone) else {
            return Ok(());
        };
        if !zone_state.active_triggers.is_empty() {
            return Err("cannot clear failsafe while a triggering condition is still active");
        }
        zone_state.mode = ZoneMode::Auto;
        zone_state.conditions_clear_since = None;
        Ok(())
    }

    pub fn active_alarms(&self, zone: &ZoneId) -> Vec<&Alarm> {
        self.alarms.values().filter(|a| &a.zone == zone).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneId {
        ZoneId::new("Flower", "main")
    }

    #[test]
    fn scenario_4_sensor_loss_forces_failsafe_then_clears() {
        let mut mgr = AlarmManager::new(Duration::from_secs(60));
        let z = zone();
        let t0 = Instant::now();
        mgr.raise(&z, AlarmName::SensorMissing, Severity::Warning, "missing 60s", t0);
        assert!(!mgr.is_failsafe(&z));

        let t1 = t0 + Duration::from_secs(120);
        mgr.raise(&z, AlarmName::SensorLoss, Severity::Critical, "all sensors missing 2min", t1);
        assert!(mgr.is_failsafe(&z));

        let t2 = t1 + Duration::from_secs(1);
        mgr.clear_condition(&z, AlarmName::SensorLoss, t2);
        mgr.tick(&z, t2);
        assert!(mgr.is_failsafe(&z), "still held until clear_hold elapses");

        let t3 = t2 + Duration::from_secs(61);
        mgr.tick(&z, t3);
        assert!(!mgr.is_failsafe(&z));
    }

    #[test]
    fn manual_clear_rejected_while_trigger_active() {
        let mut mgr = AlarmManager::new(Duration::from_secs(60));
        let z = zone();
        let t0 = Instant::now();
        mgr.raise(&z, AlarmName::HardwareFault, Severity::Critical, "channel 3 faulted", t0);
        assert!(mgr.clear_failsafe(&z).is_err());
    }

    #[test]
    fn non_failsafe_alarms_never_change_zone_mode() {
        let mut mgr = AlarmManager::new(Duration::from_secs(60));
        let z = zone();
        mgr.raise(&z, AlarmName::DbLoss, Severity::Warning, "buffer 85% full", Instant::now());
        assert_eq!(mgr.zone_mode(&z), ZoneMode::Auto);
    }
}
