//! Startup configuration (spec §6 "Configuration (startup)").
//!
//! Config is loaded once into an immutable snapshot; a reload (§9 REDESIGN
//! FLAG: "mutable global config reloaded in place" → atomic snapshot) builds
//! a brand new `ControlConfig` and is swapped in via `arc_swap::ArcSwap` in
//! `main.rs`. The control worker always reads the snapshot it captured at
//! tick start.

use crate::domain::{
    BoardId, Device, DeviceId, DeviceKind, DimmingDescriptor, SafeState, SetpointKind,
    SetpointPriorities, ZoneId,
};
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;

fn default_update_interval() -> u64 {
    1
}
fn default_last_good_hold() -> u64 {
    30
}
fn default_rate_limit_seconds() -> u64 {
    5
}
fn default_min_on_off() -> u32 {
    5
}
fn default_interlock_max_passes() -> u8 {
    8
}
fn default_missing_alarm_period() -> u64 {
    60
}
fn default_max_db_lookback() -> u64 {
    300
}
fn default_failsafe_clear_hold() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub control: ControlSection,
    pub hardware: HardwareSection,
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, DeviceConfig>>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub photoperiod: BTreeMap<String, PhotoperiodConfig>,
    #[serde(default)]
    pub climate_phases: BTreeMap<String, ClimatePhasesConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_health_port() -> u16 {
    9300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    #[serde(default = "default_update_interval")]
    pub update_interval_seconds: u64,
    #[serde(default = "default_last_good_hold")]
    pub last_good_hold_period_seconds: u64,
    #[serde(default = "default_max_db_lookback")]
    pub max_db_lookback_seconds: u64,
    #[serde(default = "default_missing_alarm_period")]
    pub missing_alarm_period_seconds: u64,
    #[serde(default = "default_failsafe_clear_hold")]
    pub failsafe_clear_hold_seconds: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub pwm: PwmConfig,
    #[serde(default = "default_interlock_max_passes")]
    pub interlock_max_passes: u8,
    #[serde(default)]
    pub pid_limits: BTreeMap<String, PidLimitsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_seconds")]
    pub pid_params_per_device_type_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            pid_params_per_device_type_seconds: default_rate_limit_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PwmConfig {
    #[serde(default = "default_min_on_off")]
    pub min_on_seconds: u32,
    #[serde(default = "default_min_on_off")]
    pub min_off_seconds: u32,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            min_on_seconds: default_min_on_off(),
            min_off_seconds: default_min_on_off(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PidLimitsConfig {
    pub kp_min: f64,
    pub kp_max: f64,
    pub ki_min: f64,
    pub ki_max: f64,
    pub kd_min: f64,
    pub kd_max: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareSection {
    pub i2c_bus: String,
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
    #[serde(default)]
    pub simulation: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoardConfig {
    pub id: String,
    pub address: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub device_type: String,
    pub cooling: Option<bool>,
    pub dimmable: Option<bool>,
    pub channel: u8,
    pub board: String,
    pub dac_channel: Option<u8>,
    #[serde(default)]
    pub pid_enabled: bool,
    #[serde(default)]
    pub pid_setpoints: BTreeMap<String, u8>,
    #[serde(default = "default_pwm_period")]
    pub pwm_period_seconds: u32,
    #[serde(default)]
    pub interlock_with: Vec<String>,
    #[serde(default)]
    pub interlock_priority: bool,
    #[serde(default)]
    pub safe_state: SafeStateConfig,
    pub target_intensity_pct: Option<f64>,
}

fn default_pwm_period() -> u32 {
    100
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeStateConfig {
    #[default]
    Off,
    On,
    LastKnown,
}

impl From<SafeStateConfig> for SafeState {
    fn from(v: SafeStateConfig) -> Self {
        match v {
            SafeStateConfig::Off => SafeState::Off,
            SafeStateConfig::On => SafeState::On,
            SafeStateConfig::LastKnown => SafeState::LastKnown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub id: u64,
    pub name: String,
    pub device_name: String,
    pub location: String,
    pub cluster: String,
    pub day_of_week: Option<u8>,
    pub start_time_seconds: u32,
    pub end_time_seconds: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: Option<String>,
    pub target_intensity: Option<f64>,
    pub ramp_up_duration_min: Option<f64>,
    pub ramp_down_duration_min: Option<f64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub id: u64,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub location: String,
    pub cluster: String,
    pub condition_sensor: String,
    pub condition_operator: String,
    pub condition_value: f64,
    pub action_device: String,
    pub action_state: u8,
    #[serde(default)]
    pub priority: u8,
    pub schedule_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoperiodConfig {
    pub day_start_seconds: u32,
    pub day_end_seconds: u32,
    pub ramp_up_duration_min: f64,
    pub ramp_down_duration_min: f64,
    pub locked_photoperiod_hours: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClimatePhasesConfig {
    pub pre_day_duration_min: f64,
    pub pre_night_duration_min: f64,
    pub day: PhaseSetpointConfig,
    pub night: PhaseSetpointConfig,
    pub pre_day: PhaseSetpointConfig,
    pub pre_night: PhaseSetpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseSetpointConfig {
    pub heating_setpoint: Option<f64>,
    pub cooling_setpoint: Option<f64>,
    pub vpd: f64,
    pub co2: f64,
    pub ramp_in_duration_min: f64,
}

/// Fully validated, immutable configuration snapshot used by the control
/// engine. Built from `RawConfig` by [`ControlConfig::load`].
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub server: ServerConfig,
    pub control: ControlSection,
    pub hardware: HardwareSection,
    pub devices: BTreeMap<DeviceId, Device>,
    pub schedules: Vec<ScheduleConfig>,
    pub rules: Vec<RuleConfig>,
    pub photoperiod: BTreeMap<ZoneId, PhotoperiodConfig>,
    pub climate_phases: BTreeMap<ZoneId, ClimatePhasesConfig>,
}

impl ControlConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content, path)
    }

    pub fn from_toml_str(content: &str, path: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut devices = BTreeMap::new();
        let mut seen_channels: BTreeMap<(String, u8), DeviceId> = BTreeMap::new();

        for (zone_key, zone_devices) in &raw.devices {
            let zone = parse_zone_key(zone_key)?;
            for (name, dc) in zone_devices {
                let id = DeviceId::new(zone.clone(), name.clone());
                let kind = parse_device_kind(&id, dc)?;

                let dimming = match (kind.is_dimmable(), dc.dac_channel) {
                    (true, Some(ch)) => Some(DimmingDescriptor {
                        board_id: BoardId(dc.board.clone()),
                        dac_channel: ch,
                    }),
                    (true, None) => {
                        return Err(ConfigError::Invalid {
                            field: format!("devices.{}.dac_channel", id),
                            reason: "dimmable device requires dac_channel".into(),
                        });
                    }
                    (false, None) => None,
                    (false, Some(_)) => {
                        return Err(ConfigError::Invalid {
                            field: format!("devices.{}.dac_channel", id),
                            reason: "non-dimmable device must not set dac_channel".into(),
                        });
                    }
                };

                let mut pid_setpoints: SetpointPriorities = SetpointPriorities::new();
                for (k, prio) in &dc.pid_setpoints {
                    let kind = parse_setpoint_kind(&id, k)?;
                    pid_setpoints.insert(kind, *prio);
                }

                let board_key = (dc.board.clone(), dc.channel);
                if let Some(existing) = seen_channels.get(&board_key) {
                    return Err(ConfigError::Invalid {
                        field: format!("devices.{}.channel", id),
                        reason: format!(
                            "channel {} on board {} already owned by {}",
                            dc.channel, dc.board, existing
                        ),
                    });
                }
                seen_channels.insert(board_key, id.clone());

                let device = Device {
                    id: id.clone(),
                    kind,
                    channel: dc.channel,
                    board: BoardId(dc.board.clone()),
                    dimming,
                    pid_enabled: dc.pid_enabled,
                    pid_setpoints,
                    pwm_period_seconds: dc.pwm_period_seconds,
                    interlock_with: dc.interlock_with.clone(),
                    interlock_priority: dc.interlock_priority,
                    safe_state: dc.safe_state.into(),
                    light_target_intensity_pct: dc.target_intensity_pct,
                };
                device.validate()?;
                devices.insert(id, device);
            }
        }

        for limits in raw.control.pid_limits.values() {
            validate_pid_limits(limits)?;
        }

        let mut photoperiod = BTreeMap::new();
        for (zone_key, cfg) in &raw.photoperiod {
            let zone = parse_zone_key(zone_key)?;
            if cfg.ramp_up_duration_min < 0.0 || cfg.ramp_up_duration_min > 240.0 {
                return Err(ConfigError::Invalid {
                    field: format!("photoperiod.{}.ramp_up_duration_min", zone_key),
                    reason: format!("{} outside 0-240", cfg.ramp_up_duration_min),
                });
            }
            if cfg.ramp_down_duration_min < 0.0 || cfg.ramp_down_duration_min > 240.0 {
                return Err(ConfigError::Invalid {
                    field: format!("photoperiod.{}.ramp_down_duration_min", zone_key),
                    reason: format!("{} outside 0-240", cfg.ramp_down_duration_min),
                });
            }
            photoperiod.insert(zone, cfg.clone());
        }

        let mut climate_phases = BTreeMap::new();
        for (zone_key, cfg) in &raw.climate_phases {
            let zone = parse_zone_key(zone_key)?;
            for phase in [&cfg.day, &cfg.night, &cfg.pre_day, &cfg.pre_night] {
                validate_phase_setpoint(zone_key, phase)?;
            }
            climate_phases.insert(zone, cfg.clone());
        }

        Ok(ControlConfig {
            server: raw.server,
            control: raw.control,
            hardware: raw.hardware,
            devices,
            schedules: raw.schedules,
            rules: raw.rules,
            photoperiod,
            climate_phases,
        })
    }
}

fn parse_zone_key(key: &str) -> Result<ZoneId, ConfigError> {
    let mut parts = key.splitn(2, '/');
    let location = parts.next().unwrap_or_default();
    let cluster = parts.next().ok_or_else(|| ConfigError::Invalid {
        field: format!("zone key `{key}`"),
        reason: "expected `location/cluster`".into(),
    })?;
    Ok(ZoneId::new(location, cluster))
}

fn parse_device_kind(id: &DeviceId, dc: &DeviceConfig) -> Result<DeviceKind, ConfigError> {
    Ok(match dc.device_type.as_str() {
        "heater" => DeviceKind::Heater,
        "fan" => DeviceKind::Fan {
            cooling: dc.cooling.unwrap_or(false),
        },
        "exhaust_fan" => DeviceKind::ExhaustFan,
        "dehumidifier" => DeviceKind::Dehumidifier,
        "humidifier" => DeviceKind::Humidifier,
        "co2" => DeviceKind::Co2,
        "light" => DeviceKind::Light {
            dimmable: dc.dimmable.unwrap_or(false),
        },
        other => {
            return Err(ConfigError::Invalid {
                field: format!("devices.{}.device_type", id),
                reason: format!("unknown device_type `{other}`"),
            });
        }
    })
}

fn parse_setpoint_kind(id: &DeviceId, key: &str) -> Result<SetpointKind, ConfigError> {
    Ok(match key {
        "heating" => SetpointKind::Heating,
        "cooling" => SetpointKind::Cooling,
        "vpd" => SetpointKind::Vpd,
        "co2" => SetpointKind::Co2,
        other => {
            return Err(ConfigError::Invalid {
                field: format!("devices.{}.pid_setpoints", id),
                reason: format!("unknown setpoint kind `{other}`"),
            });
        }
    })
}

fn validate_pid_limits(limits: &PidLimitsConfig) -> Result<(), ConfigError> {
    if limits.kp_min > limits.kp_max {
        return Err(ConfigError::Invalid {
            field: "control.pid_limits.kp".into(),
            reason: "kp_min must be <= kp_max".into(),
        });
    }
    if limits.ki_min > limits.ki_max {
        return Err(ConfigError::Invalid {
            field: "control.pid_limits.ki".into(),
            reason: "ki_min must be <= ki_max".into(),
        });
    }
    if limits.kd_min > limits.kd_max {
        return Err(ConfigError::Invalid {
            field: "control.pid_limits.kd".into(),
            reason: "kd_min must be <= kd_max".into(),
        });
    }
    Ok(())
}

fn validate_phase_setpoint(zone_key: &str, phase: &PhaseSetpointConfig) -> Result<(), ConfigError> {
    if let (Some(h), Some(c)) = (phase.heating_setpoint, phase.cooling_setpoint) {
        if h > c {
            return Err(ConfigError::Invalid {
                field: format!("climate_phases.{zone_key}"),
                reason: format!("heating_setpoint {h} must be <= cooling_setpoint {c}"),
            });
        }
    }
    for (field, val, range) in [
        ("heating_setpoint", phase.heating_setpoint, 10.0..=35.0),
        ("cooling_setpoint", phase.cooling_setpoint, 10.0..=35.0),
    ] {
        if let Some(v) = val {
            if !range.contains(&v) {
                return Err(ConfigError::Invalid {
                    field: format!("climate_phases.{zone_key}.{field}"),
                    reason: format!("{v} outside {:?}", range),
                });
            }
        }
    }
    if !(400.0..=2000.0).contains(&phase.co2) {
        return Err(ConfigError::Invalid {
            field: format!("climate_phases.{zone_key}.co2"),
            reason: format!("{} outside 400-2000", phase.co2),
        });
    }
    if !(0.0..=5.0).contains(&phase.vpd) {
        return Err(ConfigError::Invalid {
            field: format!("climate_phases.{zone_key}.vpd"),
            reason: format!("{} outside 0-5", phase.vpd),
        });
    }
    if !(0.0..=240.0).contains(&phase.ramp_in_duration_min) {
        return Err(ConfigError::Invalid {
            field: format!("climate_phases.{zone_key}.ramp_in_duration_min"),
            reason: format!("{} outside 0-240", phase.ramp_in_duration_min),
        });
    }
    if phase.ramp_in_duration_min > 15.0 {
        tracing::warn!(
            zone = zone_key,
            ramp_in_duration_min = phase.ramp_in_duration_min,
            "vpd ramp-in duration exceeds 15 minutes, may cause stomatal shock"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn loads_and_validates_sample() {
        let cfg = ControlConfig::from_toml_str(SAMPLE, "test").unwrap();
        let zone = ZoneId::new("Flower", "front");
        let id = DeviceId::new(zone, "heater_1");
        let dev = cfg.devices.get(&id).unwrap();
        assert_eq!(dev.channel, 0);
        assert!(dev.pid_enabled);
    }

    #[test]
    fn rejects_duplicate_channel_on_same_board() {
        let toml = r#"
            [control]
            [hardware]
            i2c_bus = "/dev/i2c-1"

            [devices."Flower/front"]
            [devices."Flower/front".heater_1]
            device_type = "heater"
            channel = 0
            board = "board_a"

            [devices."Flower/front".heater_2]
            device_type = "heater"
            channel = 0
            board = "board_a"
        "#;
        let err = ControlConfig::from_toml_str(toml, "test").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_light_with_pid_enabled() {
        let toml = r#"
            [control]
            [hardware]
            i2c_bus = "/dev/i2c-1"

            [devices."Flower/front"]
            [devices."Flower/front".light_1]
            device_type = "light"
            dimmable = true
            channel = 5
            board = "board_a"
            dac_channel = 0
            pid_enabled = true
        "#;
        let err = ControlConfig::from_toml_str(toml, "test").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
