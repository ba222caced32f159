//! C13 Control Engine: the per-tick orchestrator (spec §4.1).
//!
//! Composes C2 (sensors) through C12 (alarms/failsafe) in the fixed order
//! the spec lays out, one zone at a time, in a stable (zone, device) order
//! so interlock cascades are deterministic (spec §5).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::alarms::manager::{Alarm, AlarmManager, AlarmName, Severity};
use crate::config::ControlConfig;
use crate::control::climate_mode::{ClimateModeConfig, ClimateModeEngine, PhaseSetpoint};
use crate::control::hysteresis::{HysteresisBank, HysteresisDirection, HysteresisParameters};
use crate::control::interlock::{InterlockManager, InterlockRule};
use crate::control::photoperiod::{PhotoperiodConfig as PpConfig, PhotoperiodEngine};
use crate::control::pid::{PidBank, DEFAULT_DEAD_BAND};
use crate::control::pwm::PwmScheduler;
use crate::control::rules::{ConditionOperator, Rule, RulesEngine};
use crate::control::schedule::Schedule;
use crate::domain::{Device, DeviceId, DeviceKind, DeviceMode, Reason, SafeState, SetpointKind, ZoneId, ZoneMode};
use crate::devices::relay_manager::RelayManager;
use crate::persistence::PersistenceWriter;
use crate::persistence::sink::AutomationStateRow;
use crate::sensors::cache::SensorCache;

/// The sensor a PID setpoint kind is driven by. Not part of `Device`
/// configuration because the same four sensors are shared by every device
/// in a zone; kept as a fixed mapping rather than per-device config.
fn sensor_name_for_setpoint(kind: SetpointKind) -> &'static str {
    match kind {
        SetpointKind::Heating | SetpointKind::Cooling => "dry_bulb_f",
        SetpointKind::Vpd => "vpd_kpa",
        SetpointKind::Co2 => "co2_ppm",
    }
}

struct ClimateZone {
    config: ClimateModeConfig,
    phases: HashMap<crate::control::climate_mode::ClimatePhase, PhaseSetpoint>,
}

struct PhotoperiodZone {
    config: PpConfig,
    ramp_up: Duration,
    ramp_down: Duration,
}

pub struct ControlEngine {
    relay: Arc<RelayManager>,
    sensors: Arc<SensorCache>,
    persistence: Arc<PersistenceWriter>,
    alarms: Mutex<AlarmManager>,
    pid_bank: Mutex<PidBank>,
    pwm: Mutex<PwmScheduler>,
    hysteresis: Mutex<HysteresisBank>,
    interlocks: BTreeMap<ZoneId, InterlockManager>,
    /// Mutable at runtime via the operator API (`upsert_rule`), unlike
    /// `interlocks`/`photoperiod` which only change on a full config reload.
    rules: RwLock<BTreeMap<ZoneId, Vec<Rule>>>,
    schedules_by_zone: RwLock<BTreeMap<ZoneId, Vec<Schedule>>>,
    schedules_by_id: RwLock<BTreeMap<u64, Schedule>>,
    photoperiod: BTreeMap<ZoneId, PhotoperiodZone>,
    climate: RwLock<BTreeMap<ZoneId, ClimateZone>>,
    missing_alarm_period: Duration,
    sensor_loss_period: Duration,
    last_tick: Mutex<Option<Instant>>,
    nominal_period: Duration,
    hw_failures: Mutex<HashMap<DeviceId, u32>>,
}

/// Consecutive hardware-apply failures on one device's channel before a
/// `hardware_fault` alarm is raised (spec §4.9).
const HARDWARE_FAULT_THRESHOLD: u32 = 3;

impl ControlEngine {
    pub fn new(
        config: &ControlConfig,
        relay: Arc<RelayManager>,
        sensors: Arc<SensorCache>,
        persistence: Arc<PersistenceWriter>,
        pid_bank: PidBank,
    ) -> Self {
        let interlocks = build_interlocks(config);
        let rules = build_rules(config);
        let schedules_by_zone = build_schedules(config);
        let schedules_by_id = schedules_by_zone
            .values()
            .flatten()
            .map(|s| (s.id, s.clone()))
            .collect::<BTreeMap<_, _>>();
        let photoperiod = build_photoperiod(config);
        let climate = build_climate(config, &photoperiod);
        let nominal_period = Duration::from_secs(config.control.update_interval_seconds.max(1));

        Self {
            relay,
            sensors,
            persistence,
            alarms: Mutex::new(AlarmManager::new(Duration::from_secs(config.control.failsafe_clear_hold_seconds))),
            pid_bank: Mutex::new(pid_bank),
            pwm: Mutex::new(PwmScheduler::new(
                Duration::from_secs(config.control.pwm.min_on_seconds as u64),
                Duration::from_secs(config.control.pwm.min_off_seconds as u64),
            )),
            hysteresis: Mutex::new(HysteresisBank::new()),
            interlocks,
            rules: RwLock::new(rules),
            schedules_by_zone: RwLock::new(schedules_by_zone),
            schedules_by_id: RwLock::new(schedules_by_id),
            photoperiod,
            climate: RwLock::new(climate),
            missing_alarm_period: Duration::from_secs(config.control.missing_alarm_period_seconds),
            sensor_loss_period: Duration::from_secs(config.control.missing_alarm_period_seconds * 2),
            last_tick: Mutex::new(None),
            nominal_period,
            hw_failures: Mutex::new(HashMap::new()),
        }
    }

    pub async fn zone_mode(&self, zone: &ZoneId) -> ZoneMode {
        self.alarms.lock().await.zone_mode(zone)
    }

    pub async fn clear_failsafe(&self, zone: &ZoneId) -> Result<(), &'static str> {
        self.alarms.lock().await.clear_failsafe(zone)
    }

    pub async fn active_alarms(&self, zone: &ZoneId) -> Vec<Alarm> {
        self.alarms.lock().await.active_alarms(zone).into_iter().cloned().collect()
    }

    pub async fn ack_alarm(&self, zone: &ZoneId, name: AlarmName, now: Instant) {
        self.alarms.lock().await.acknowledge(zone, name, now);
    }

    /// Requests a PID parameter update for every controller of
    /// `device_type` (spec §6 `set_pid_params`), subject to the bank's
    /// per-device-type rate limit.
    pub async fn request_pid_update(&self, device_type: &'static str, params: crate::control::pid::PidParameters, now: Instant) -> bool {
        self.pid_bank.lock().await.request_param_update(device_type, params, now)
    }

    /// Replaces (or inserts) one rule, keyed by `rule.id`, for `zone`
    /// (spec §6 `upsert_rule`).
    pub async fn upsert_rule(&self, zone: ZoneId, rule: Rule) {
        let mut rules = self.rules.write().await;
        let entry = rules.entry(zone).or_default();
        entry.retain(|r| r.id != rule.id);
        entry.push(rule);
    }

    /// Replaces (or inserts) one schedule, keyed by `schedule.id`, for
    /// `zone` (spec §6 `upsert_schedule`).
    pub async fn upsert_schedule(&self, zone: ZoneId, schedule: Schedule) {
        let mut by_zone = self.schedules_by_zone.write().await;
        let entry = by_zone.entry(zone).or_default();
        entry.retain(|s| s.id != schedule.id);
        entry.push(schedule.clone());
        drop(by_zone);
        self.schedules_by_id.write().await.insert(schedule.id, schedule);
    }

    /// Replaces the setpoint tuple for one `(zone, phase)` (spec §6
    /// `upsert_setpoint`). Fails if `zone` has no configured climate
    /// schedule to attach the phase to.
    pub async fn upsert_setpoint(
        &self,
        zone: &ZoneId,
        phase: crate::control::climate_mode::ClimatePhase,
        setpoint: PhaseSetpoint,
    ) -> Result<(), &'static str> {
        let mut climate = self.climate.write().await;
        let zone_climate = climate.get_mut(zone).ok_or("zone has no configured climate phases")?;
        zone_climate.phases.insert(phase, setpoint);
        Ok(())
    }

    pub async fn setpoint(&self, zone: &ZoneId, phase: crate::control::climate_mode::ClimatePhase) -> Option<PhaseSetpoint> {
        self.climate.read().await.get(zone)?.phases.get(&phase).copied()
    }

    /// Schedule ids currently configured for `zone`, used by the operator
    /// API to validate a rule's `schedule_id` gate references something
    /// real before accepting the rule (spec §6 validated mutating calls).
    pub async fn schedule_ids_for(&self, zone: &ZoneId) -> Vec<u64> {
        self.schedules_by_zone
            .read()
            .await
            .get(zone)
            .into_iter()
            .flatten()
            .map(|s| s.id)
            .collect()
    }

    /// Runs one full tick across every configured zone (spec §4.1 steps
    /// 1–6). Errors from one zone never prevent the rest from running
    /// (spec: "any exception in steps 2–5 for one zone must not prevent
    /// other zones from being processed").
    pub async fn tick(&self, now: Instant, wall_time: DateTime<Utc>) {
        let dt = {
            let mut last = self.last_tick.lock().await;
            let dt = match *last {
                Some(prev) => now.saturating_duration_since(prev),
                None => self.nominal_period,
            };
            *last = Some(now);
            dt.min(self.nominal_period * 5)
        };

        let mut by_zone: BTreeMap<&ZoneId, Vec<&Device>> = BTreeMap::new();
        for id in self.relay.device_ids() {
            if let Some(device) = self.relay.device(id) {
                by_zone.entry(&device.id.zone).or_default().push(device);
            }
        }

        for (zone, mut zone_devices) in by_zone {
            zone_devices.sort_by(|a, b| a.id.name.cmp(&b.id.name));
            if let Err(err) = self.tick_zone(zone, &zone_devices, dt, now, wall_time).await {
                tracing::error!(zone = %zone, error = %err, "zone tick failed, other zones unaffected");
            }
        }
    }

    async fn tick_zone(
        &self,
        zone: &ZoneId,
        devices: &[&Device],
        dt: Duration,
        now: Instant,
        wall_time: DateTime<Utc>,
    ) -> Result<(), crate::error::ControlError> {
        self.alarms.lock().await.tick(zone, now);
        let failsafe = self.alarms.lock().await.is_failsafe(zone);

        let active_setpoint = self.active_setpoint(zone, wall_time).await;
        let mut sensor_cache: HashMap<String, Option<crate::sensors::cache::SensorReading>> = HashMap::new();
        for name in self.zone_sensor_names(zone).await {
            let reading = self.sensors.read(zone, &name).await;
            sensor_cache.insert(name, reading);
        }
        self.track_zone_alarms(zone, &sensor_cache).await;

        let mut candidates: BTreeMap<DeviceId, u8> = BTreeMap::new();
        let mut intensities: HashMap<DeviceId, Option<f64>> = HashMap::new();
        let mut reasons: BTreeMap<DeviceId, Reason> = BTreeMap::new();
        let mut rule_ids: HashMap<DeviceId, Option<u64>> = HashMap::new();
        let mut schedule_ids: HashMap<DeviceId, Option<u64>> = HashMap::new();
        let mut duty_cycles: HashMap<DeviceId, Option<f64>> = HashMap::new();
        let mut pid_outputs: HashMap<DeviceId, Option<f64>> = HashMap::new();
        let mut current_states: BTreeMap<DeviceId, u8> = BTreeMap::new();
        let mut modes: HashMap<DeviceId, DeviceMode> = HashMap::new();

        for device in devices {
            let current = self.relay.read_state(&device.id).await;
            let current_state = current.as_ref().map(|s| s.state).unwrap_or(0);
            current_states.insert(device.id.clone(), current_state);
            modes.insert(device.id.clone(), current.as_ref().map(|s| s.mode).unwrap_or(DeviceMode::Auto));

            if failsafe {
                let (state, intensity) = self.safe_state_command(device, current_state, current.as_ref().and_then(|s| s.intensity_pct));
                candidates.insert(device.id.clone(), state);
                intensities.insert(device.id.clone(), intensity);
                reasons.insert(device.id.clone(), Reason::Failsafe);
                continue;
            }

            let manual = current.as_ref().map(|s| s.mode == DeviceMode::Manual).unwrap_or(false);
            if manual {
                candidates.insert(device.id.clone(), current_state);
                intensities.insert(device.id.clone(), current.as_ref().and_then(|s| s.intensity_pct));
                reasons.insert(device.id.clone(), current.map(|s| s.last_reason).unwrap_or(Reason::Manual));
                continue;
            }

            if device.kind.is_light() {
                let command = self.light_command(zone, device, wall_time, &active_setpoint);
                candidates.insert(device.id.clone(), command.0);
                intensities.insert(device.id.clone(), Some(command.1));
                reasons.insert(device.id.clone(), Reason::Photoperiod);
                continue;
            }

            if let Some((rule, matched)) = self.matching_rule(zone, &device.id.name, wall_time, &sensor_cache).await {
                candidates.insert(device.id.clone(), matched);
                reasons.insert(device.id.clone(), Reason::Rule);
                rule_ids.insert(device.id.clone(), Some(rule));
                continue;
            }

            if let Some((state, schedule_id)) = self.schedule_command(zone, &device.id.name, wall_time).await {
                candidates.insert(device.id.clone(), state);
                reasons.insert(device.id.clone(), Reason::Schedule);
                schedule_ids.insert(device.id.clone(), schedule_id);
                continue;
            }

            if device.pid_enabled {
                let (state, duty_pct, pid_pct) = self.pid_command(device, &active_setpoint, &sensor_cache, dt, now).await;
                candidates.insert(device.id.clone(), state);
                reasons.insert(device.id.clone(), Reason::Pid);
                duty_cycles.insert(device.id.clone(), duty_pct);
                pid_outputs.insert(device.id.clone(), pid_pct);
                continue;
            }

            if device.kind.uses_hysteresis() {
                let state = self.hysteresis_command(device, &active_setpoint, &sensor_cache).await;
                candidates.insert(device.id.clone(), state);
                reasons.insert(device.id.clone(), Reason::Pid);
                continue;
            }

            candidates.insert(device.id.clone(), current_state);
            reasons.insert(device.id.clone(), current.map(|s| s.last_reason).unwrap_or(Reason::Startup));
        }

        if let Some(interlock) = self.interlocks.get(zone) {
            let kinds: BTreeMap<DeviceId, DeviceKind> = devices.iter().map(|d| (d.id.clone(), d.kind)).collect();
            if let Some(warning) = interlock.apply(&mut candidates, &mut reasons, &kinds, &current_states) {
                self.alarms.lock().await.raise(
                    zone,
                    AlarmName::InterlockCycle,
                    Severity::Warning,
                    format!("interlock did not converge after {} passes", warning.passes),
                    now,
                );
            }
        }

        for device in devices {
            let state = candidates.get(&device.id).copied().unwrap_or(0);
            let intensity = intensities.get(&device.id).copied().flatten();
            let reason = reasons.get(&device.id).copied().unwrap_or(Reason::Startup);
            let rule_id = rule_ids.get(&device.id).copied().flatten();
            let schedule_id = schedule_ids.get(&device.id).copied().flatten();
            let duty_pct = duty_cycles.get(&device.id).copied().flatten();

            let transition = match self
                .relay
                .apply(&device.id, state, intensity, reason, rule_id, schedule_id, duty_pct)
                .await
            {
                Ok(transition) => {
                    self.hw_failures.lock().await.remove(&device.id);
                    transition
                }
                Err(crate::error::ControlError::Hardware(err)) => {
                    let mut failures = self.hw_failures.lock().await;
                    let count = failures.entry(device.id.clone()).or_insert(0);
                    *count += 1;
                    if *count >= HARDWARE_FAULT_THRESHOLD {
                        self.alarms.lock().await.raise(
                            zone,
                            AlarmName::HardwareFault,
                            Severity::Critical,
                            format!("{} failed to apply {} times: {err}", device.id, *count),
                            now,
                        );
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            let row = AutomationStateRow {
                device: device.id.clone(),
                timestamp_ms: wall_time.timestamp_millis(),
                state,
                mode: format!("{:?}", modes.get(&device.id).copied().unwrap_or(DeviceMode::Auto)).to_lowercase(),
                duty_cycle_pct: duty_pct,
                pid_output_pct: pid_outputs.get(&device.id).copied().flatten(),
                active_rule_id: rule_id,
                active_schedule_id: schedule_id,
                reason,
            };
            if let Some(pressure) = self.persistence.enqueue_automation_state(row) {
                self.alarms.lock().await.raise(
                    zone,
                    AlarmName::DbLoss,
                    Severity::Warning,
                    format!("persistence buffer {}/{}", pressure.depth, pressure.capacity),
                    now,
                );
            }
            if let Some(transition) = transition {
                if let Some(pressure) = self.persistence.enqueue_control_history(transition) {
                    self.alarms.lock().await.raise(
                        zone,
                        AlarmName::DbLoss,
                        Severity::Warning,
                        format!("persistence buffer {}/{}", pressure.depth, pressure.capacity),
                        now,
                    );
                }
            }
        }

        let zone_has_faults = {
            let failures = self.hw_failures.lock().await;
            devices.iter().any(|d| failures.get(&d.id).copied().unwrap_or(0) >= HARDWARE_FAULT_THRESHOLD)
        };
        if !zone_has_faults {
            self.alarms.lock().await.clear_condition(zone, AlarmName::HardwareFault, now);
        }

        Ok(())
    }

    fn safe_state_command(&self, device: &Device, current_state: u8, current_intensity: Option<f64>) -> (u8, Option<f64>) {
        match device.safe_state {
            SafeState::Off => (0, device.kind.is_dimmable().then_some(0.0)),
            SafeState::On => (1, device.light_target_intensity_pct.filter(|_| device.kind.is_dimmable())),
            SafeState::LastKnown => (current_state, current_intensity),
        }
    }

    async fn zone_sensor_names(&self, zone: &ZoneId) -> Vec<String> {
        let mut names: Vec<String> = vec!["dry_bulb_f".into(), "vpd_kpa".into(), "co2_ppm".into()];
        let rules = self.rules.read().await;
        for rule in rules.get(zone).into_iter().flatten() {
            names.push(rule.condition_sensor.clone());
        }
        names.sort();
        names.dedup();
        names
    }

    /// Raises `sensor_missing` at `Severity::Warning` once a sensor has
    /// been unreadable for `missing_alarm_period`, escalating it to
    /// `Severity::Critical` past `missing_alarm_period * 5` (spec §4.9's
    /// warning -> critical table). Separately, once every sensor in the
    /// zone has been unreadable for `sensor_loss_period`, raises the
    /// zone-wide `sensor_loss` alarm, which forces failsafe.
    async fn track_zone_alarms(&self, zone: &ZoneId, readings: &HashMap<String, Option<crate::sensors::cache::SensorReading>>) {
        let mut any_present = false;
        let mut all_missing_long_enough = !readings.is_empty();
        for (name, reading) in readings {
            if reading.is_some() {
                any_present = true;
                self.alarms.lock().await.clear_condition(zone, AlarmName::SensorMissing, Instant::now());
                continue;
            }
            let missing_for = self.sensors.missing_duration(zone, name).await.unwrap_or_default();
            if missing_for >= self.missing_alarm_period * 5 {
                self.alarms.lock().await.raise(
                    zone,
                    AlarmName::SensorMissing,
                    Severity::Critical,
                    format!("{name} missing for {missing_for:?}, escalated past {:?}", self.missing_alarm_period * 5),
                    Instant::now(),
                );
            } else if missing_for >= self.missing_alarm_period {
                self.alarms.lock().await.raise(
                    zone,
                    AlarmName::SensorMissing,
                    Severity::Warning,
                    format!("{name} missing for {missing_for:?}"),
                    Instant::now(),
                );
            }
            if missing_for < self.sensor_loss_period {
                all_missing_long_enough = false;
            }
        }
        if !any_present && all_missing_long_enough {
            self.alarms.lock().await.raise(
                zone,
                AlarmName::SensorLoss,
                Severity::Critical,
                "all zone sensors missing",
                Instant::now(),
            );
        } else {
            self.alarms.lock().await.clear_condition(zone, AlarmName::SensorLoss, Instant::now());
        }
    }

    async fn active_setpoint(&self, zone: &ZoneId, wall_time: DateTime<Utc>) -> Option<crate::control::climate_mode::ActiveSetpoint> {
        let climate = self.climate.read().await;
        let climate = climate.get(zone)?;
        let seconds = wall_time.time().num_seconds_from_midnight();
        let (phase, elapsed) = ClimateModeEngine::phase_at(&climate.config, seconds);
        let current = climate.phases.get(&phase)?;
        let prev_phase = previous_phase(phase);
        let prev = climate.phases.get(&prev_phase).unwrap_or(current);
        Some(ClimateModeEngine::active_setpoint(prev, current, phase, elapsed))
    }

    fn light_command(
        &self,
        zone: &ZoneId,
        device: &Device,
        wall_time: DateTime<Utc>,
        _active_setpoint: &Option<crate::control::climate_mode::ActiveSetpoint>,
    ) -> (u8, f64) {
        let Some(pp) = self.photoperiod.get(zone) else {
            return (0, 0.0);
        };
        let seconds = wall_time.time().num_seconds_from_midnight();
        let target = device.light_target_intensity_pct.unwrap_or(100.0);
        let intensity = PhotoperiodEngine::intensity_at(&pp.config, pp.ramp_up, pp.ramp_down, seconds, target);
        (intensity.state, intensity.fraction)
    }

    async fn matching_rule(
        &self,
        zone: &ZoneId,
        device_name: &str,
        wall_time: DateTime<Utc>,
        sensor_cache: &HashMap<String, Option<crate::sensors::cache::SensorReading>>,
    ) -> Option<(u64, u8)> {
        let rules = self.rules.read().await;
        let rules = rules.get(zone)?;
        let seconds = wall_time.time().num_seconds_from_midnight();
        let dow = chrono_weekday_index(wall_time);
        let schedules_by_id = self.schedules_by_id.read().await;
        let gated: Vec<Rule> = rules
            .iter()
            .filter(|r| match r.schedule_id {
                Some(sid) => schedules_by_id
                    .get(&sid)
                    .map(|s| s.is_active(seconds, dow))
                    .unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect();
        let winner = RulesEngine::evaluate(&gated, device_name, self.sensors.last_good_hold_period(), |name| {
            sensor_cache.get(name).copied().flatten()
        })?;
        Some((winner.id, winner.action_state))
    }

    async fn schedule_command(&self, zone: &ZoneId, device_name: &str, wall_time: DateTime<Utc>) -> Option<(u8, Option<u64>)> {
        let schedules = self.schedules_by_zone.read().await;
        let schedules = schedules.get(zone)?;
        let for_device: Vec<&Schedule> = schedules.iter().filter(|s| s.device_name == device_name).collect();
        if for_device.is_empty() {
            return None;
        }
        let seconds = wall_time.time().num_seconds_from_midnight();
        let dow = chrono_weekday_index(wall_time);
        let active = for_device.iter().find(|s| s.is_active(seconds, dow));
        Some((if active.is_some() { 1 } else { 0 }, active.map(|s| s.id)))
    }

    async fn pid_command(
        &self,
        device: &Device,
        active_setpoint: &Option<crate::control::climate_mode::ActiveSetpoint>,
        sensor_cache: &HashMap<String, Option<crate::sensors::cache::SensorReading>>,
        dt: Duration,
        now: Instant,
    ) -> (u8, Option<f64>, Option<f64>) {
        let mut setpoints = BTreeMap::new();
        let mut readings = BTreeMap::new();
        for (&kind, &priority) in &device.pid_setpoints {
            let Some(target) = setpoint_value(kind, active_setpoint) else { continue };
            setpoints.insert(kind, (target, priority));
            readings.insert(kind, sensor_cache.get(sensor_name_for_setpoint(kind)).copied().flatten());
        }

        let mut pid_bank = self.pid_bank.lock().await;
        let winner = pid_bank.tick_device(
            &device.id,
            device.kind.type_label(),
            &setpoints,
            &readings,
            DEFAULT_DEAD_BAND,
            self.sensors.last_good_hold_period(),
            dt,
            now,
        );
        drop(pid_bank);

        let Some((_, output)) = winner else {
            return (0, None, None);
        };

        let mut pwm = self.pwm.lock().await;
        let duty = pwm.duty_state(&device.id, output, Duration::from_secs(device.pwm_period_seconds as u64), now);
        (if duty.on { 1 } else { 0 }, Some(duty.duty_cycle_pct), Some(output))
    }

    async fn hysteresis_command(
        &self,
        device: &Device,
        active_setpoint: &Option<crate::control::climate_mode::ActiveSetpoint>,
        sensor_cache: &HashMap<String, Option<crate::sensors::cache::SensorReading>>,
    ) -> u8 {
        let (sensor_name, params) = match device.kind {
            DeviceKind::Dehumidifier => (
                "vpd_kpa",
                active_setpoint.map(|a| HysteresisParameters::new(a.vpd, HysteresisDirection::FallingTurnsOn)),
            ),
            DeviceKind::Humidifier => (
                "vpd_kpa",
                active_setpoint.map(|a| HysteresisParameters::new(a.vpd, HysteresisDirection::RisingTurnsOn)),
            ),
            DeviceKind::Fan { .. } => (
                "dry_bulb_f",
                active_setpoint.and_then(|a| a.cooling_setpoint.or(a.heating_setpoint)).map(|sp| {
                    HysteresisParameters::new(sp, HysteresisDirection::RisingTurnsOn)
                }),
            ),
            _ => return 0,
        };
        let Some(params) = params else { return 0 };
        let value = sensor_cache.get(sensor_name).copied().flatten().map(|r| r.value);
        let mut bank = self.hysteresis.lock().await;
        if bank.tick(&device.id, &params, value) { 1 } else { 0 }
    }
}

fn setpoint_value(kind: SetpointKind, active: &Option<crate::control::climate_mode::ActiveSetpoint>) -> Option<f64> {
    let active = active.as_ref()?;
    match kind {
        SetpointKind::Heating => active.heating_setpoint,
        SetpointKind::Cooling => active.cooling_setpoint,
        SetpointKind::Vpd => Some(active.vpd),
        SetpointKind::Co2 => Some(active.co2),
    }
}

fn previous_phase(phase: crate::control::climate_mode::ClimatePhase) -> crate::control::climate_mode::ClimatePhase {
    use crate::control::climate_mode::ClimatePhase::*;
    match phase {
        PreDay => Night,
        Day => PreDay,
        PreNight => Day,
        Night => PreNight,
    }
}

/// `0 = Sunday .. 6 = Saturday`, matching the convention used by
/// `Schedule.day_of_week` in configuration.
fn chrono_weekday_index(wall_time: DateTime<Utc>) -> u8 {
    wall_time.weekday().num_days_from_sunday() as u8
}

/// Priority override for a pair, sourced from each device's own
/// `interlock_priority` flag (spec §4.7: "the winner is configurable").
/// `None` when neither side (or both sides, which is a config error we
/// don't reject here) claims priority, falling back to the default
/// heater-wins rule.
fn interlock_priority(config: &ControlConfig, a: &DeviceId, b: &DeviceId) -> Option<DeviceId> {
    if config.devices.get(a).map(|d| d.interlock_priority).unwrap_or(false) {
        Some(a.clone())
    } else if config.devices.get(b).map(|d| d.interlock_priority).unwrap_or(false) {
        Some(b.clone())
    } else {
        None
    }
}

fn build_interlocks(config: &ControlConfig) -> BTreeMap<ZoneId, InterlockManager> {
    let mut rules_by_zone: BTreeMap<ZoneId, Vec<InterlockRule>> = BTreeMap::new();
    for device in config.devices.values() {
        for other_name in &device.interlock_with {
            let other_id = DeviceId::new(device.id.zone.clone(), other_name.clone());
            if !config.devices.contains_key(&other_id) {
                continue;
            }
            let (a, b) = if device.id.name < *other_name {
                (device.id.clone(), other_id)
            } else {
                (other_id, device.id.clone())
            };
            let entry = rules_by_zone.entry(device.id.zone.clone()).or_default();
            if !entry.iter().any(|r| r.a == a && r.b == b) {
                let priority = interlock_priority(config, &a, &b);
                entry.push(InterlockRule { a, b, priority });
            }
        }
    }
    rules_by_zone
        .into_iter()
        .map(|(zone, rules)| (zone, InterlockManager::new(rules, config.control.interlock_max_passes)))
        .collect()
}

fn build_rules(config: &ControlConfig) -> BTreeMap<ZoneId, Vec<Rule>> {
    let mut by_zone: BTreeMap<ZoneId, Vec<Rule>> = BTreeMap::new();
    for rc in &config.rules {
        let zone = ZoneId::new(rc.location.clone(), rc.cluster.clone());
        let Some(operator) = ConditionOperator::parse(&rc.condition_operator) else {
            tracing::warn!(rule_id = rc.id, operator = %rc.condition_operator, "unknown condition operator, rule disabled");
            continue;
        };
        by_zone.entry(zone).or_default().push(Rule {
            id: rc.id,
            enabled: rc.enabled,
            condition_sensor: rc.condition_sensor.clone(),
            condition_operator: operator,
            condition_value: rc.condition_value,
            action_device: rc.action_device.clone(),
            action_state: rc.action_state,
            priority: rc.priority,
            schedule_id: rc.schedule_id,
        });
    }
    by_zone
}

fn build_schedules(config: &ControlConfig) -> BTreeMap<ZoneId, Vec<Schedule>> {
    let mut by_zone: BTreeMap<ZoneId, Vec<Schedule>> = BTreeMap::new();
    for sc in &config.schedules {
        let zone = ZoneId::new(sc.location.clone(), sc.cluster.clone());
        by_zone.entry(zone).or_default().push(Schedule {
            id: sc.id,
            device_name: sc.device_name.clone(),
            day_of_week: sc.day_of_week,
            start_time: sc.start_time_seconds,
            end_time: sc.end_time_seconds,
            enabled: sc.enabled,
            target_intensity: sc.target_intensity,
        });
    }
    by_zone
}

fn build_photoperiod(config: &ControlConfig) -> BTreeMap<ZoneId, PhotoperiodZone> {
    config
        .photoperiod
        .iter()
        .map(|(zone, cfg)| {
            let pp = PpConfig {
                day_start: cfg.day_start_seconds,
                day_end: cfg.day_end_seconds,
                ramp_up: Duration::from_secs_f64(cfg.ramp_up_duration_min * 60.0),
                ramp_down: Duration::from_secs_f64(cfg.ramp_down_duration_min * 60.0),
            };
            let (ramp_up, ramp_down) = PhotoperiodEngine::reshape_ramps(&pp);
            (zone.clone(), PhotoperiodZone { config: pp, ramp_up, ramp_down })
        })
        .collect()
}

fn build_climate(config: &ControlConfig, photoperiod: &BTreeMap<ZoneId, PhotoperiodZone>) -> BTreeMap<ZoneId, ClimateZone> {
    use crate::control::climate_mode::ClimatePhase;

    let mut out = BTreeMap::new();
    for (zone, cfg) in &config.climate_phases {
        let Some(pp) = photoperiod.get(zone) else {
            tracing::warn!(zone = %zone, "climate_phases configured without a matching photoperiod, skipping");
            continue;
        };
        let config_mode = ClimateModeConfig {
            day_start: pp.config.day_start,
            day_end: pp.config.day_end,
            pre_day_duration: Duration::from_secs_f64(cfg.pre_day_duration_min * 60.0),
            pre_night_duration: Duration::from_secs_f64(cfg.pre_night_duration_min * 60.0),
        };
        let mut phases = HashMap::new();
        for (phase, setpoint_cfg) in [
            (ClimatePhase::Day, &cfg.day),
            (ClimatePhase::Night, &cfg.night),
            (ClimatePhase::PreDay, &cfg.pre_day),
            (ClimatePhase::PreNight, &cfg.pre_night),
        ] {
            phases.insert(
                phase,
                PhaseSetpoint {
                    heating_setpoint: setpoint_cfg.heating_setpoint,
                    cooling_setpoint: setpoint_cfg.cooling_setpoint,
                    vpd: setpoint_cfg.vpd,
                    co2: setpoint_cfg.co2,
                    ramp_in: Duration::from_secs_f64(setpoint_cfg.ramp_in_duration_min * 60.0),
                },
            );
        }
        out.insert(zone.clone(), ClimateZone { config: config_mode, phases });
    }
    out
}
