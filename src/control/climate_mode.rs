//! C8 Climate Mode Engine (spec §4.5).
//!
//! Derives PRE_DAY/DAY/PRE_NIGHT/NIGHT from the photoperiod boundaries plus
//! two configured durations, and interpolates each phase's setpoint tuple
//! across the phase boundary. Exposes setpoints only — it does not decide
//! device state itself (spec §4.5: "it does not itself decide device
//! states").

use std::time::Duration;

use crate::timeutil::{self, TimeOfDay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClimatePhase {
    PreDay,
    Day,
    PreNight,
    Night,
}

#[derive(Debug, Clone, Copy)]
pub struct ClimateModeConfig {
    pub day_start: TimeOfDay,
    pub day_end: TimeOfDay,
    pub pre_day_duration: Duration,
    pub pre_night_duration: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseSetpoint {
    pub heating_setpoint: Option<f64>,
    pub cooling_setpoint: Option<f64>,
    pub vpd: f64,
    pub co2: f64,
    pub ramp_in: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ActiveSetpoint {
    pub heating_setpoint: Option<f64>,
    pub cooling_setpoint: Option<f64>,
    pub vpd: f64,
    pub co2: f64,
    pub phase: ClimatePhase,
}

struct PhaseWindow {
    phase: ClimatePhase,
    start: TimeOfDay,
    len: u32,
}

fn phase_windows(cfg: &ClimateModeConfig) -> [PhaseWindow; 4] {
    let pre_day_start = timeutil::subtract(cfg.day_start, cfg.pre_day_duration);
    let pre_night_start = timeutil::subtract(cfg.day_end, cfg.pre_night_duration);
    let day_len = timeutil::duration_seconds(cfg.day_start, pre_night_start);
    let night_len = timeutil::duration_seconds(cfg.day_end, pre_day_start);

    [
        PhaseWindow {
            phase: ClimatePhase::PreDay,
            start: pre_day_start,
            len: cfg.pre_day_duration.as_secs() as u32,
        },
        PhaseWindow {
            phase: ClimatePhase::Day,
            start: cfg.day_start,
            len: day_len,
        },
        PhaseWindow {
            phase: ClimatePhase::PreNight,
            start: pre_night_start,
            len: cfg.pre_night_duration.as_secs() as u32,
        },
        PhaseWindow {
            phase: ClimatePhase::Night,
            start: cfg.day_end,
            len: night_len,
        },
    ]
}

pub struct ClimateModeEngine;

impl ClimateModeEngine {
    /// The phase containing `t`, and how long `t` has been inside it.
    pub fn phase_at(cfg: &ClimateModeConfig, t: TimeOfDay) -> (ClimatePhase, Duration) {
        for window in phase_windows(cfg) {
            if timeutil::in_window(t, window.start, window.len) {
                let elapsed = timeutil::duration_seconds(window.start, t);
                return (window.phase, Duration::from_secs(elapsed as u64));
            }
        }
        // Every second of the day belongs to exactly one phase unless both
        // pre-phases are zero-length and day/night exactly partition it;
        // fall back to Day as the widest conventional default.
        (ClimatePhase::Day, Duration::ZERO)
    }

    /// Linearly interpolates from `prev`'s setpoint to `current`'s over
    /// `current.ramp_in`, per spec §4.5: `active(t) = prev + (new - prev) *
    /// clamp((t - phase_start) / ramp_in, 0, 1)`.
    pub fn active_setpoint(
        prev: &PhaseSetpoint,
        current: &PhaseSetpoint,
        phase: ClimatePhase,
        elapsed_in_phase: Duration,
    ) -> ActiveSetpoint {
        let ramp_in_s = current.ramp_in.as_secs_f64();
        let frac = if ramp_in_s > 0.0 {
            (elapsed_in_phase.as_secs_f64() / ramp_in_s).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let lerp = |p: Option<f64>, n: Option<f64>| match (p, n) {
            (Some(p), Some(n)) => Some(p + (n - p) * frac),
            (None, v) => v,
            (p, None) => p,
        };

        ActiveSetpoint {
            heating_setpoint: lerp(prev.heating_setpoint, current.heating_setpoint),
            cooling_setpoint: lerp(prev.cooling_setpoint, current.cooling_setpoint),
            vpd: prev.vpd + (current.vpd - prev.vpd) * frac,
            co2: prev.co2 + (current.co2 - prev.co2) * frac,
            phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ClimateModeConfig {
        ClimateModeConfig {
            day_start: 6 * 3600,
            day_end: 22 * 3600,
            pre_day_duration: Duration::from_secs(30 * 60),
            pre_night_duration: Duration::from_secs(30 * 60),
        }
    }

    #[test]
    fn phases_partition_the_day() {
        let c = cfg();
        assert_eq!(ClimateModeEngine::phase_at(&c, 5 * 3600 + 45 * 60).0, ClimatePhase::PreDay);
        assert_eq!(ClimateModeEngine::phase_at(&c, 12 * 3600).0, ClimatePhase::Day);
        assert_eq!(ClimateModeEngine::phase_at(&c, 21 * 3600 + 45 * 60).0, ClimatePhase::PreNight);
        assert_eq!(ClimateModeEngine::phase_at(&c, 23 * 3600).0, ClimatePhase::Night);
    }

    #[test]
    fn zero_pre_phase_is_absorbed_by_neighbors() {
        let c = ClimateModeConfig {
            day_start: 6 * 3600,
            day_end: 22 * 3600,
            pre_day_duration: Duration::ZERO,
            pre_night_duration: Duration::ZERO,
        };
        assert_eq!(ClimateModeEngine::phase_at(&c, 6 * 3600).0, ClimatePhase::Day);
        assert_eq!(ClimateModeEngine::phase_at(&c, 22 * 3600).0, ClimatePhase::Night);
    }

    #[test]
    fn ramp_interpolates_linearly() {
        let prev = PhaseSetpoint {
            heating_setpoint: Some(18.0),
            cooling_setpoint: Some(24.0),
            vpd: 0.8,
            co2: 400.0,
            ramp_in: Duration::from_secs(600),
        };
        let current = PhaseSetpoint {
            heating_setpoint: Some(22.0),
            cooling_setpoint: Some(28.0),
            vpd: 1.2,
            co2: 1000.0,
            ramp_in: Duration::from_secs(600),
        };
        let active = ClimateModeEngine::active_setpoint(&prev, &current, ClimatePhase::Day, Duration::from_secs(300));
        assert!((active.heating_setpoint.unwrap() - 20.0).abs() < 1e-9);
        assert!((active.co2 - 700.0).abs() < 1e-9);
    }
}
