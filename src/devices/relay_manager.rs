//! C4 Relay Manager (spec §4.8, §3 `DeviceState`).
//!
//! Exclusively owns `DeviceState` mutation (spec §3 "Ownership"): the
//! Control Engine only ever calls `apply`/`set_mode` here, never writes
//! device state directly. Every successful apply is atomic with the
//! hardware write — on hardware failure, `DeviceState` is left untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{Device, DeviceId, DeviceMode, Reason, SafeState};
use crate::error::ControlError;
use crate::hardware::{DacBus, RelayBus};
use crate::persistence::sink::ControlHistoryRow as Transition;

/// The authoritative runtime record per device (spec §3 `DeviceState`).
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub state: u8,
    pub mode: DeviceMode,
    pub intensity_pct: Option<f64>,
    pub last_change_ts: DateTime<Utc>,
    pub last_reason: Reason,
    pub last_rule_id: Option<u64>,
    pub last_schedule_id: Option<u64>,
    pub duty_cycle_pct: Option<f64>,
}

impl DeviceState {
    fn startup(dimmable: bool) -> Self {
        Self {
            state: 0,
            mode: DeviceMode::Auto,
            intensity_pct: if dimmable { Some(0.0) } else { None },
            last_change_ts: Utc::now(),
            last_reason: Reason::Startup,
            last_rule_id: None,
            last_schedule_id: None,
            duty_cycle_pct: None,
        }
    }
}

pub struct RelayManager {
    devices: BTreeMap<DeviceId, Device>,
    states: RwLock<BTreeMap<DeviceId, DeviceState>>,
    sequences: RwLock<BTreeMap<DeviceId, AtomicU64>>,
    relay_bus: Arc<dyn RelayBus>,
    dac_bus: Arc<dyn DacBus>,
}

impl RelayManager {
    /// Startup sequence (spec §4.8): open the bus (the caller constructs
    /// `relay_bus`/`dac_bus` already opened), assert all relays OFF, then
    /// restore each device to its persisted last state unless `safe_state
    /// == Off` and `safe_start` is requested.
    pub async fn start(
        devices: BTreeMap<DeviceId, Device>,
        relay_bus: Arc<dyn RelayBus>,
        dac_bus: Arc<dyn DacBus>,
        persisted: BTreeMap<DeviceId, DeviceState>,
        safe_start: bool,
    ) -> Result<Self, ControlError> {
        relay_bus
            .commit_all(0)
            .await
            .map_err(ControlError::Hardware)?;

        let mut states = BTreeMap::new();
        let mut sequences = BTreeMap::new();
        for (id, device) in &devices {
            let restore = persisted.get(id).cloned();
            let initial = match (restore, device.safe_state, safe_start) {
                (Some(saved), SafeState::Off, true) => DeviceState {
                    state: 0,
                    ..saved
                },
                (Some(saved), _, _) => saved,
                (None, _, _) => DeviceState::startup(device.kind.is_dimmable()),
            };
            if initial.state == 1 {
                relay_bus
                    .set_channel(device.channel, true)
                    .await
                    .map_err(ControlError::Hardware)?;
            }
            if let (Some(dimming), Some(pct)) = (&device.dimming, initial.intensity_pct) {
                dac_bus
                    .set_percent(&dimming.board_id.0, dimming.dac_channel, pct)
                    .await
                    .map_err(ControlError::Hardware)?;
            }
            states.insert(id.clone(), initial);
            sequences.insert(id.clone(), AtomicU64::new(0));
        }

        Ok(Self {
            devices,
            states: RwLock::new(states),
            sequences: RwLock::new(sequences),
            relay_bus,
            dac_bus,
        })
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.keys()
    }

    pub async fn read_state(&self, id: &DeviceId) -> Option<DeviceState> {
        self.states.read().await.get(id).cloned()
    }

    pub async fn all_states(&self) -> BTreeMap<DeviceId, DeviceState> {
        self.states.read().await.clone()
    }

    /// Commits `state`/`intensity` through C3 and, on success, updates
    /// `DeviceState` and returns the resulting transition. Returns `Ok(None)`
    /// when the candidate is unchanged from the current state (R2:
    /// idempotent re-apply emits no transition).
    #[allow(clippy::too_many_arguments)]
    pub async fn apply(
        &self,
        id: &DeviceId,
        state: u8,
        intensity_pct: Option<f64>,
        reason: Reason,
        rule_id: Option<u64>,
        schedule_id: Option<u64>,
        duty_cycle_pct: Option<f64>,
    ) -> Result<Option<Transition>, ControlError> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| ControlError::EmptyZone { zone: id.zone.to_string() })?;

        let old_state = {
            let states = self.states.read().await;
            states.get(id).map(|s| s.state).unwrap_or(0)
        };

        self.relay_bus
            .set_channel(device.channel, state == 1)
            .await
            .map_err(ControlError::Hardware)?;
        if let (Some(dimming), Some(pct)) = (&device.dimming, intensity_pct) {
            self.dac_bus
                .set_percent(&dimming.board_id.0, dimming.dac_channel, pct)
                .await
                .map_err(ControlError::Hardware)?;
        }

        let changed = old_state != state;
        let transition = if changed {
            let sequences = self.sequences.read().await;
            let seq = sequences
                .get(id)
                .map(|c| c.fetch_add(1, Ordering::SeqCst) + 1)
                .unwrap_or(1);
            Some(Transition {
                device: id.clone(),
                sequence: seq,
                timestamp_ms: Utc::now().timestamp_millis(),
                old_state,
                new_state: state,
                reason,
                alarm_name: None,
            })
        } else {
            None
        };

        let mut states = self.states.write().await;
        let entry = states.entry(id.clone()).or_insert_with(|| DeviceState::startup(false));
        entry.state = state;
        entry.intensity_pct = intensity_pct.or(entry.intensity_pct);
        entry.last_change_ts = Utc::now();
        entry.last_reason = reason;
        entry.last_rule_id = rule_id;
        entry.last_schedule_id = schedule_id;
        entry.duty_cycle_pct = duty_cycle_pct;

        if changed {
            tracing::info!(device = %id, old_state, new_state = state, reason = %reason, "device transition");
        }

        Ok(transition)
    }

    /// Changes per-device mode (spec §4.8); the current `DeviceState` is
    /// already the record restarts use, so entering `manual` needs no
    /// extra bookkeeping beyond the mode flip.
    pub async fn set_mode(&self, id: &DeviceId, mode: DeviceMode) -> Result<(), ControlError> {
        let mut states = self.states.write().await;
        let entry = states
            .get_mut(id)
            .ok_or_else(|| ControlError::EmptyZone { zone: id.zone.to_string() })?;
        entry.mode = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BoardId, DeviceKind, SetpointPriorities, ZoneId};
    use crate::hardware::SimulatedBus;

    fn heater(id: &DeviceId) -> Device {
        Device {
            id: id.clone(),
            kind: DeviceKind::Heater,
            channel: 0,
            board: BoardId("board_a".into()),
            dimming: None,
            pid_enabled: true,
            pid_setpoints: SetpointPriorities::new(),
            pwm_period_seconds: 100,
            interlock_with: vec![],
            interlock_priority: false,
            safe_state: SafeState::Off,
            light_target_intensity_pct: None,
        }
    }

    #[tokio::test]
    async fn apply_updates_state_and_returns_transition_on_change() {
        let id = DeviceId::new(ZoneId::new("Flower", "front"), "heater_1");
        let mut devices = BTreeMap::new();
        devices.insert(id.clone(), heater(&id));
        let bus = Arc::new(SimulatedBus::new());
        let mgr = RelayManager::start(devices, bus.clone(), bus.clone(), BTreeMap::new(), false)
            .await
            .unwrap();

        let t = mgr
            .apply(&id, 1, None, Reason::Pid, None, None, Some(75.0))
            .await
            .unwrap();
        assert!(t.is_some());
        assert_eq!(mgr.read_state(&id).await.unwrap().state, 1);
        assert!(bus.get_channel(0).await.unwrap());
    }

    #[tokio::test]
    async fn reapplying_same_state_emits_no_transition() {
        let id = DeviceId::new(ZoneId::new("Flower", "front"), "heater_1");
        let mut devices = BTreeMap::new();
        devices.insert(id.clone(), heater(&id));
        let bus = Arc::new(SimulatedBus::new());
        let mgr = RelayManager::start(devices, bus.clone(), bus, BTreeMap::new(), false)
            .await
            .unwrap();

        mgr.apply(&id, 1, None, Reason::Pid, None, None, None)
            .await
            .unwrap();
        let second = mgr
            .apply(&id, 1, None, Reason::Pid, None, None, None)
            .await
            .unwrap();
        assert!(second.is_none());
    }
}
