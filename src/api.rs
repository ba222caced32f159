//! Operator-facing function surface (spec §6): the seam an HTTP/gRPC layer
//! sits behind. `ControlCore` holds no state of its own beyond `Arc`
//! handles to the pieces that already own it — the Relay Manager for
//! device state, the Control Engine for alarms/failsafe/rules/schedules/
//! setpoints/PID parameters — and every mutating call is validated against
//! config-derived ranges before it reaches them.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::alarms::manager::{Alarm, AlarmName};
use crate::config::ControlConfig;
use crate::control::climate_mode::{ClimatePhase, PhaseSetpoint};
use crate::control::pid::PidParameters;
use crate::control::rules::{ConditionOperator, Rule};
use crate::control::schedule::Schedule;
use crate::devices::relay_manager::{DeviceState, RelayManager};
use crate::domain::{DeviceId, DeviceMode, Reason, ZoneId, ZoneMode};
use crate::engine::ControlEngine;
use crate::error::{ControlError, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("rejected: {0}")]
    Rejected(&'static str),
}

fn validate_range(field: &str, value: f64, range: std::ops::RangeInclusive<f64>) -> Result<(), ValidationError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(field, value, range))
    }
}

/// Unvalidated rule fields as an operator would submit them (mirrors
/// `config::RuleConfig`'s shape so the same parsing applies to both the
/// startup file and a runtime upsert).
pub struct RuleInput {
    pub id: u64,
    pub enabled: bool,
    pub condition_sensor: String,
    pub condition_operator: String,
    pub condition_value: f64,
    pub action_device: String,
    pub action_state: u8,
    pub priority: u8,
    pub schedule_id: Option<u64>,
}

pub struct ScheduleInput {
    pub id: u64,
    pub device_name: String,
    pub day_of_week: Option<u8>,
    pub start_time_seconds: u32,
    pub end_time_seconds: u32,
    pub enabled: bool,
    pub target_intensity: Option<f64>,
}

pub struct PidParamsInput {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// Parsed `device_type` label accepted by `set_pid_params`, matching
/// `DeviceKind::type_label` (spec §6 `pid:params:<device_type>`).
fn pid_device_type(label: &str) -> Option<&'static str> {
    Some(match label {
        "heater" => "heater",
        "fan" => "fan",
        "exhaust_fan" => "exhaust_fan",
        "dehumidifier" => "dehumidifier",
        "humidifier" => "humidifier",
        "co2" => "co2",
        "light" => "light",
        _ => return None,
    })
}

pub struct ControlCore {
    config: Arc<ControlConfig>,
    relay: Arc<RelayManager>,
    engine: Arc<ControlEngine>,
}

impl ControlCore {
    pub fn new(config: Arc<ControlConfig>, relay: Arc<RelayManager>, engine: Arc<ControlEngine>) -> Self {
        Self { config, relay, engine }
    }

    pub async fn get_device_state(&self, id: &DeviceId) -> Option<DeviceState> {
        self.relay.read_state(id).await
    }

    /// Commands a device directly, bypassing arbitration, and pins its mode
    /// to `manual` so the next tick holds it there (spec I2: manual is
    /// sticky until failsafe).
    pub async fn apply_manual(&self, id: &DeviceId, state: u8, reason: Reason) -> Result<(), ApiError> {
        validate_range(&format!("{id}.state"), state as f64, 0.0..=1.0)?;
        self.relay.set_mode(id, DeviceMode::Manual).await?;
        self.relay.apply(id, state, None, reason, None, None, None).await?;
        Ok(())
    }

    pub async fn set_device_mode(&self, id: &DeviceId, mode: DeviceMode) -> Result<(), ApiError> {
        self.relay.set_mode(id, mode).await?;
        Ok(())
    }

    /// Validates a phase setpoint against the same ranges `config.rs`
    /// enforces at startup (10-35°F heating/cooling, 400-2000ppm CO2,
    /// 0-5kPa VPD, 0-240min ramp-in) before writing it through.
    pub async fn upsert_setpoint(&self, zone: &ZoneId, phase: ClimatePhase, setpoint: PhaseSetpoint) -> Result<(), ApiError> {
        if let (Some(h), Some(c)) = (setpoint.heating_setpoint, setpoint.cooling_setpoint) {
            if h > c {
                return Err(ApiError::Rejected("heating_setpoint must be <= cooling_setpoint"));
            }
        }
        if let Some(h) = setpoint.heating_setpoint {
            validate_range("heating_setpoint", h, 10.0..=35.0)?;
        }
        if let Some(c) = setpoint.cooling_setpoint {
            validate_range("cooling_setpoint", c, 10.0..=35.0)?;
        }
        validate_range("co2", setpoint.co2, 400.0..=2000.0)?;
        validate_range("vpd", setpoint.vpd, 0.0..=5.0)?;
        validate_range("ramp_in_duration_seconds", setpoint.ramp_in.as_secs_f64(), 0.0..=14400.0)?;

        self.engine
            .upsert_setpoint(zone, phase, setpoint)
            .await
            .map_err(ApiError::Rejected)
    }

    pub async fn get_setpoint(&self, zone: &ZoneId, phase: ClimatePhase) -> Option<PhaseSetpoint> {
        self.engine.setpoint(zone, phase).await
    }

    /// Validates `input.action_device` names a device actually configured
    /// in `zone` and that the condition operator is recognized, then
    /// upserts by `id`.
    pub async fn upsert_rule(&self, zone: ZoneId, input: RuleInput) -> Result<(), ApiError> {
        let device_id = DeviceId::new(zone.clone(), input.action_device.clone());
        if !self.config.devices.contains_key(&device_id) {
            return Err(ApiError::Rejected("action_device is not configured in this zone"));
        }
        validate_range("action_state", input.action_state as f64, 0.0..=1.0)?;
        let Some(operator) = ConditionOperator::parse(&input.condition_operator) else {
            return Err(ApiError::Rejected("unrecognized condition_operator"));
        };
        if let Some(sid) = input.schedule_id {
            if !self.engine.schedule_ids_for(&zone).await.contains(&sid) {
                return Err(ApiError::Rejected("schedule_id does not reference a schedule in this zone"));
            }
        }

        self.engine
            .upsert_rule(
                zone,
                Rule {
                    id: input.id,
                    enabled: input.enabled,
                    condition_sensor: input.condition_sensor,
                    condition_operator: operator,
                    condition_value: input.condition_value,
                    action_device: input.action_device,
                    action_state: input.action_state,
                    priority: input.priority,
                    schedule_id: input.schedule_id,
                },
            )
            .await;
        Ok(())
    }

    pub async fn upsert_schedule(&self, zone: ZoneId, input: ScheduleInput) -> Result<(), ApiError> {
        let device_id = DeviceId::new(zone.clone(), input.device_name.clone());
        if !self.config.devices.contains_key(&device_id) {
            return Err(ApiError::Rejected("device_name is not configured in this zone"));
        }
        validate_range("start_time_seconds", input.start_time_seconds as f64, 0.0..=86399.0)?;
        validate_range("end_time_seconds", input.end_time_seconds as f64, 0.0..=86400.0)?;
        if let Some(d) = input.day_of_week {
            validate_range("day_of_week", d as f64, 0.0..=6.0)?;
        }
        if let Some(pct) = input.target_intensity {
            validate_range("target_intensity", pct, 0.0..=100.0)?;
        }

        self.engine
            .upsert_schedule(
                zone,
                Schedule {
                    id: input.id,
                    device_name: input.device_name,
                    day_of_week: input.day_of_week,
                    start_time: input.start_time_seconds,
                    end_time: input.end_time_seconds,
                    enabled: input.enabled,
                    target_intensity: input.target_intensity,
                },
            )
            .await;
        Ok(())
    }

    /// Validates against `control.pid_limits.<device_type>` when the
    /// operator configured limits for that type, then requests the update
    /// (subject to the bank's per-device-type rate limit, spec §4.3).
    pub async fn set_pid_params(&self, device_type: &str, params: PidParamsInput) -> Result<bool, ApiError> {
        let Some(label) = pid_device_type(device_type) else {
            return Err(ApiError::Rejected("unrecognized device_type"));
        };
        if let Some(limits) = self.config.control.pid_limits.get(label) {
            validate_range("kp", params.kp, limits.kp_min..=limits.kp_max)?;
            validate_range("ki", params.ki, limits.ki_min..=limits.ki_max)?;
            validate_range("kd", params.kd, limits.kd_min..=limits.kd_max)?;
        }
        let full = PidParameters {
            kp: params.kp,
            ki: params.ki,
            kd: params.kd,
            i_max: 100.0,
            updated_at: Utc::now(),
            source: "api".into(),
        };
        Ok(self.engine.request_pid_update(label, full, Instant::now()).await)
    }

    pub async fn get_failsafe(&self, zone: &ZoneId) -> bool {
        self.engine.zone_mode(zone).await == ZoneMode::Failsafe
    }

    pub async fn clear_failsafe(&self, zone: &ZoneId) -> Result<(), ApiError> {
        self.engine.clear_failsafe(zone).await.map_err(ApiError::Rejected)
    }

    pub async fn active_alarms(&self, zone: &ZoneId) -> Vec<Alarm> {
        self.engine.active_alarms(zone).await
    }

    pub async fn ack_alarm(&self, zone: &ZoneId, name: AlarmName) {
        self.engine.ack_alarm(zone, name, Instant::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::hardware::SimulatedBus;
    use crate::persistence::PersistenceWriter;
    use crate::persistence::sink::InMemorySink;
    use crate::sensors::cache::SensorCache;
    use crate::statebus::InMemoryStateBus;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [control]
        update_interval_seconds = 1

        [hardware]
        i2c_bus = "/dev/i2c-1"
        simulation = true

        [devices."Flower/front"]
        [devices."Flower/front".heater_1]
        device_type = "heater"
        channel = 0
        board = "board_a"
        pid_enabled = true
        pwm_period_seconds = 100
        [devices."Flower/front".heater_1.pid_setpoints]
        heating = 0
    "#;

    async fn core() -> (ControlCore, DeviceId) {
        let raw: RawConfig = toml::from_str(SAMPLE).unwrap();
        let config = Arc::new(ControlConfig::from_raw(raw).unwrap());
        let zone = ZoneId::new("Flower", "front");
        let device_id = DeviceId::new(zone, "heater_1");

        let bus = Arc::new(SimulatedBus::new());
        let relay = Arc::new(
            RelayManager::start(config.devices.clone(), bus.clone(), bus, BTreeMap::new(), false)
                .await
                .unwrap(),
        );
        let state_bus = Arc::new(InMemoryStateBus::new());
        let sink = Arc::new(InMemorySink::new(10));
        let sensors = Arc::new(SensorCache::new(
            state_bus,
            sink.clone(),
            Duration::from_secs(30),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        let persistence = Arc::new(PersistenceWriter::spawn(sink, 100));
        let pid_bank = crate::control::pid::PidBank::new(Duration::from_secs(5));
        let engine = Arc::new(ControlEngine::new(&config, relay.clone(), sensors, persistence, pid_bank));

        (ControlCore::new(config, relay, engine), device_id)
    }

    #[tokio::test]
    async fn apply_manual_pins_mode_and_state() {
        let (api, id) = core().await;
        api.apply_manual(&id, 1, Reason::Manual).await.unwrap();
        let state = api.get_device_state(&id).await.unwrap();
        assert_eq!(state.state, 1);
        assert_eq!(state.mode, DeviceMode::Manual);
    }

    #[tokio::test]
    async fn apply_manual_rejects_out_of_range_state() {
        let (api, id) = core().await;
        assert!(api.apply_manual(&id, 2, Reason::Manual).await.is_err());
    }

    #[tokio::test]
    async fn set_pid_params_validates_against_configured_limits() {
        let (api, _id) = core().await;
        let ok = api
            .set_pid_params("heater", PidParamsInput { kp: 1.0, ki: 0.0, kd: 0.0 })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn upsert_rule_rejects_unknown_action_device() {
        let (api, _id) = core().await;
        let zone = ZoneId::new("Flower", "front");
        let err = api
            .upsert_rule(
                zone,
                RuleInput {
                    id: 1,
                    enabled: true,
                    condition_sensor: "dry_bulb_f".into(),
                    condition_operator: ">".into(),
                    condition_value: 28.0,
                    action_device: "nonexistent".into(),
                    action_state: 1,
                    priority: 10,
                    schedule_id: None,
                },
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn get_failsafe_false_on_startup() {
        let (api, _id) = core().await;
        assert!(!api.get_failsafe(&ZoneId::new("Flower", "front")).await);
    }
}
