//! C5 PID Bank (spec §4.3).
//!
//! One [`PidController`] per `(device, setpoint_kind)`. Multi-setpoint
//! devices (e.g. a fan with both heating and cooling setpoints) run one
//! controller per setpoint and arbitrate by priority; only the winning
//! controller's integral advances this tick.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::domain::{DeviceId, SetpointKind};
use crate::sensors::cache::SensorReading;

#[derive(Debug, Clone)]
pub struct PidParameters {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub i_max: f64,
    pub updated_at: DateTime<Utc>,
    pub source: String,
}

impl Default for PidParameters {
    fn default() -> Self {
        Self {
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            i_max: 100.0,
            updated_at: Utc::now(),
            source: "config".into(),
        }
    }
}

/// Per-controller running state, preserved verbatim across a parameter
/// hot-reload (spec §4.3 scenario 6: "the integral term is preserved").
#[derive(Debug, Clone, Default)]
struct ControllerState {
    integral: f64,
    prev_error: Option<f64>,
    prev_output: f64,
    last_tick_at: Option<Instant>,
}

pub struct PidController {
    params: PidParameters,
    state: ControllerState,
}

impl PidController {
    pub fn new(params: PidParameters) -> Self {
        Self {
            params,
            state: ControllerState::default(),
        }
    }

    pub fn set_params(&mut self, params: PidParameters) {
        self.params = params;
    }

    /// One PID step (spec §4.3). `dt` is clamped by the caller to
    /// `<= 5 * nominal_period` (spec §5) before being passed in. When the
    /// sensor is not fresh (`measurement.is_none()`), the controller
    /// freezes: the integral does not advance and the previous output is
    /// returned unchanged.
    pub fn step(&mut self, setpoint: f64, measurement: Option<f64>, dt: Duration, now: Instant) -> f64 {
        self.state.last_tick_at = Some(now);
        let Some(y) = measurement else {
            return self.state.prev_output;
        };

        let e = setpoint - y;
        let dt_s = dt.as_secs_f64();

        let p = self.params.kp * e;
        let integral_candidate = (self.state.integral + self.params.ki * e * dt_s)
            .clamp(-self.params.i_max, self.params.i_max);
        let d = if dt_s > 0.0 {
            self.params.kd * (e - self.state.prev_error.unwrap_or(e)) / dt_s
        } else {
            0.0
        };

        let raw = p + integral_candidate + d;
        let u = raw.clamp(0.0, 100.0);

        // Anti-windup: a saturating step whose integral pushed further in
        // the direction of the error is rolled back rather than accumulated.
        let saturated = (raw - u).abs() > f64::EPSILON;
        let same_direction = e.signum() != 0.0 && e.signum() == integral_candidate.signum();
        self.state.integral = if saturated && same_direction {
            self.state.integral
        } else {
            integral_candidate
        };

        self.state.prev_error = Some(e);
        self.state.prev_output = u;
        u
    }

    pub fn last_output(&self) -> f64 {
        self.state.prev_output
    }
}

/// Default dead-band below which a candidate error does not contest
/// priority arbitration (spec §4.3: "exceeds a dead-band threshold
/// (default 0)").
pub const DEFAULT_DEAD_BAND: f64 = 0.0;

struct RateLimitedParams {
    active: PidParameters,
    last_applied_at: Option<Instant>,
}

/// Owns every device's PID controllers and the per-`device_type` parameter
/// cache with its rate limit (spec §4.3: "at most one [update] per 5s per
/// device_type").
pub struct PidBank {
    controllers: BTreeMap<(DeviceId, SetpointKind), PidController>,
    params_by_type: BTreeMap<&'static str, RateLimitedParams>,
    rate_limit: Duration,
}

impl PidBank {
    pub fn new(rate_limit: Duration) -> Self {
        Self {
            controllers: BTreeMap::new(),
            params_by_type: BTreeMap::new(),
            rate_limit,
        }
    }

    pub fn seed_params(&mut self, device_type: &'static str, params: PidParameters) {
        self.params_by_type.insert(
            device_type,
            RateLimitedParams {
                active: params,
                last_applied_at: None,
            },
        );
    }

    pub fn params_for(&self, device_type: &str) -> Option<PidParameters> {
        self.params_by_type.get(device_type).map(|r| r.active.clone())
    }

    /// Requests a parameter update for every controller keyed by
    /// `device_type`. Coalesced: if a prior update landed within
    /// `rate_limit`, this call replaces the pending value without
    /// extending the window; it takes effect once the window has elapsed
    /// and the controller starts its next tick. Returns `true` if applied
    /// immediately, `false` if rate-limited (still recorded as pending).
    pub fn request_param_update(&mut self, device_type: &'static str, params: PidParameters, now: Instant) -> bool {
        let entry = self.params_by_type.entry(device_type).or_insert_with(|| RateLimitedParams {
            active: PidParameters::default(),
            last_applied_at: None,
        });
        let elapsed_ok = entry
            .last_applied_at
            .map(|t| now.duration_since(t) >= self.rate_limit)
            .unwrap_or(true);
        if elapsed_ok {
            entry.active = params;
            entry.last_applied_at = Some(now);
            true
        } else {
            tracing::warn!(device_type, "pid parameter update rate-limited, coalescing");
            entry.active = params;
            false
        }
    }

    fn controller_mut(&mut self, device: &DeviceId, setpoint: SetpointKind, device_type: &'static str) -> &mut PidController {
        let params = self
            .params_by_type
            .get(device_type)
            .map(|r| r.active.clone())
            .unwrap_or_default();
        self.controllers
            .entry((device.clone(), setpoint))
            .or_insert_with(|| PidController::new(params))
    }

    /// Runs every configured setpoint's PID for a device and returns the
    /// winning `(setpoint_kind, output_pct)` per the multi-setpoint
    /// priority rule (spec §4.3), or `None` if no setpoint's sensor is
    /// fresh enough / exceeds the dead-band. A reading whose source is not
    /// `Live`/`LastGood`, or whose age exceeds `last_good_hold_period`,
    /// freezes that setpoint's controller (I6, spec §4.3: "if sensor
    /// source is not live or last_good, the PID freezes").
    #[allow(clippy::too_many_arguments)]
    pub fn tick_device(
        &mut self,
        device: &DeviceId,
        device_type: &'static str,
        setpoints: &BTreeMap<SetpointKind, (f64, u8)>,
        readings: &BTreeMap<SetpointKind, Option<SensorReading>>,
        dead_band: f64,
        last_good_hold_period: Duration,
        dt: Duration,
        now: Instant,
    ) -> Option<(SetpointKind, f64)> {
        // Refresh active parameters at the start of this tick (spec §4.3:
        // "update atomically at the start of the next tick").
        let params = self
            .params_by_type
            .get(device_type)
            .map(|r| r.active.clone())
            .unwrap_or_default();

        let mut candidates: Vec<(u8, SetpointKind, f64, f64)> = Vec::new(); // (priority, kind, output, |error|)
        for (&kind, &(setpoint_value, priority)) in setpoints {
            let controller = self.controller_mut(device, kind, device_type);
            controller.set_params(params.clone());

            let reading = readings.get(&kind).copied().flatten();
            let fresh = reading.map(|r| r.is_fresh_enough(last_good_hold_period)).unwrap_or(false);
            let measurement = if fresh { reading.map(|r| r.value) } else { None };
            let output = controller.step(setpoint_value, measurement, dt, now);

            if fresh {
                let error = (setpoint_value - measurement.unwrap()).abs();
                if error > dead_band {
                    candidates.push((priority, kind, output, error));
                }
            }
        }

        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.3.total_cmp(&a.3)));
        candidates.into_iter().next().map(|(_, kind, output, _)| (kind, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::cache::SensorSource;

    fn reading(v: f64) -> SensorReading {
        SensorReading {
            value: v,
            source: SensorSource::Live,
            age: Duration::from_secs(0),
        }
    }

    #[test]
    fn reaches_expected_steady_state_duty() {
        // A first-order plant (heater duty raises the measurement, ambient
        // loss pulls it back down) so the loop actually settles instead of
        // running open-loop against a constant measurement, which would
        // just saturate the integrator at full duty.
        let mut c = PidController::new(PidParameters {
            kp: 25.0,
            ki: 0.02,
            kd: 0.0,
            i_max: 100.0,
            updated_at: Utc::now(),
            source: "config".into(),
        });
        let mut now = Instant::now();
        let mut y = 22.0;
        let mut u = 0.0;
        let ambient = 15.0;
        let gain = 0.08;
        let loss = 0.05;
        for _ in 0..2000 {
            now += Duration::from_secs(1);
            u = c.step(25.0, Some(y), Duration::from_secs(1), now);
            y += gain * u - loss * (y - ambient);
        }
        assert!(u < 100.0, "u saturated at {u}, plant never converged");
        assert!((y - 25.0).abs() < 1.0, "plant settled at y={y}, expected near setpoint 25.0");
    }

    #[test]
    fn freezes_when_sensor_missing() {
        let mut c = PidController::new(PidParameters::default());
        let now = Instant::now();
        let first = c.step(25.0, Some(20.0), Duration::from_secs(1), now);
        let frozen = c.step(25.0, None, Duration::from_secs(1), now + Duration::from_secs(1));
        assert_eq!(first, frozen);
    }

    #[test]
    fn output_always_in_range() {
        let mut c = PidController::new(PidParameters {
            kp: 1000.0,
            ki: 1000.0,
            kd: 0.0,
            i_max: 1_000_000.0,
            updated_at: Utc::now(),
            source: "config".into(),
        });
        let now = Instant::now();
        let u = c.step(100.0, Some(-100.0), Duration::from_secs(1), now);
        assert!((0.0..=100.0).contains(&u));
    }

    #[test]
    fn higher_priority_fresh_setpoint_wins() {
        let mut bank = PidBank::new(Duration::from_secs(5));
        bank.seed_params("fan", PidParameters {
            kp: 10.0,
            ki: 0.0,
            kd: 0.0,
            i_max: 100.0,
            updated_at: Utc::now(),
            source: "config".into(),
        });
        let device = DeviceId::new(crate::domain::ZoneId::new("Flower", "front"), "fan_1");
        let mut setpoints = BTreeMap::new();
        setpoints.insert(SetpointKind::Cooling, (25.0, 0));
        setpoints.insert(SetpointKind::Heating, (20.0, 1));
        let mut readings = BTreeMap::new();
        readings.insert(SetpointKind::Cooling, Some(reading(30.0)));
        readings.insert(SetpointKind::Heating, Some(reading(10.0)));

        let winner = bank.tick_device(
            &device,
            "fan",
            &setpoints,
            &readings,
            DEFAULT_DEAD_BAND,
            Duration::from_secs(300),
            Duration::from_secs(1),
            Instant::now(),
        );
        assert_eq!(winner.unwrap().0, SetpointKind::Cooling);
    }

    #[test]
    fn stale_db_reading_freezes_controller() {
        let mut bank = PidBank::new(Duration::from_secs(5));
        bank.seed_params("fan", PidParameters {
            kp: 10.0,
            ki: 0.0,
            kd: 0.0,
            i_max: 100.0,
            updated_at: Utc::now(),
            source: "config".into(),
        });
        let device = DeviceId::new(crate::domain::ZoneId::new("Flower", "front"), "fan_1");
        let mut setpoints = BTreeMap::new();
        setpoints.insert(SetpointKind::Cooling, (25.0, 0));
        let mut readings = BTreeMap::new();
        readings.insert(
            SetpointKind::Cooling,
            Some(SensorReading {
                value: 30.0,
                source: SensorSource::Db,
                age: Duration::from_secs(60),
            }),
        );

        let winner = bank.tick_device(
            &device,
            "fan",
            &setpoints,
            &readings,
            DEFAULT_DEAD_BAND,
            Duration::from_secs(30),
            Duration::from_secs(1),
            Instant::now(),
        );
        assert!(winner.is_none());
    }
}
