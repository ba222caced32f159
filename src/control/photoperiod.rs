//! C7 Photoperiod Engine (spec §4.4).
//!
//! Computes per-zone light intensity from a configured day window and
//! ramp-up/ramp-down durations. Kept independent of the climate phase
//! engine (spec §9: "the light overlay is visual/semantic context...and
//! must not alter climate phase computation").

use std::time::Duration;

use crate::timeutil::{self, SECONDS_PER_DAY, TimeOfDay, in_window};

#[derive(Debug, Clone, Copy)]
pub struct PhotoperiodConfig {
    pub day_start: TimeOfDay,
    pub day_end: TimeOfDay,
    pub ramp_up: Duration,
    pub ramp_down: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct LightIntensity {
    pub fraction: f64,
    pub state: u8,
}

fn photoperiod_duration_seconds(day_start: u32, day_end: u32) -> u32 {
    timeutil::duration_seconds(day_start, day_end)
}

pub struct PhotoperiodEngine;

impl PhotoperiodEngine {
    /// Shrinks overlapping ramps so they meet at the photoperiod midpoint
    /// (spec B3), logging a warning. Returns the reshaped `(ramp_up,
    /// ramp_down)` pair; a no-op when they already fit.
    pub fn reshape_ramps(cfg: &PhotoperiodConfig) -> (Duration, Duration) {
        let duration = photoperiod_duration_seconds(cfg.day_start, cfg.day_end) as f64;
        let up = cfg.ramp_up.as_secs_f64();
        let down = cfg.ramp_down.as_secs_f64();
        if up + down <= duration {
            return (cfg.ramp_up, cfg.ramp_down);
        }
        tracing::warn!(
            ramp_up_s = up,
            ramp_down_s = down,
            photoperiod_s = duration,
            "ramp_up + ramp_down exceeds photoperiod duration, reshaping to meet at midpoint"
        );
        if up + down <= 0.0 {
            return (Duration::ZERO, Duration::ZERO);
        }
        // Same up:down ratio, but scaled so they sum to exactly the
        // photoperiod duration and meet at the midpoint.
        let new_up = duration * (up / (up + down));
        let new_down = duration - new_up;
        (Duration::from_secs_f64(new_up), Duration::from_secs_f64(new_down))
    }

    /// `i(t)` per spec §4.4, using already-reshaped ramp durations.
    pub fn intensity_at(cfg: &PhotoperiodConfig, ramp_up: Duration, ramp_down: Duration, t: TimeOfDay, target_pct: f64) -> LightIntensity {
        let ramp_up_s = ramp_up.as_secs_f64();
        let ramp_down_s = ramp_down.as_secs_f64();

        let up_start = cfg.day_start;
        let down_start = (cfg.day_end + SECONDS_PER_DAY - ramp_down.as_secs() as u32) % SECONDS_PER_DAY;

        let fraction = if in_window(t, up_start, ramp_up.as_secs() as u32) && ramp_up_s > 0.0 {
            let elapsed = ((t + SECONDS_PER_DAY - up_start) % SECONDS_PER_DAY) as f64;
            (elapsed / ramp_up_s).clamp(0.0, 1.0)
        } else if in_window(t, down_start, ramp_down.as_secs() as u32) && ramp_down_s > 0.0 {
            let elapsed = ((t + SECONDS_PER_DAY - down_start) % SECONDS_PER_DAY) as f64;
            (1.0 - elapsed / ramp_down_s).clamp(0.0, 1.0)
        } else if in_window(
            t,
            (up_start + ramp_up.as_secs() as u32) % SECONDS_PER_DAY,
            photoperiod_duration_seconds(cfg.day_start, cfg.day_end).saturating_sub(ramp_up.as_secs() as u32 + ramp_down.as_secs() as u32),
        ) {
            1.0
        } else {
            0.0
        };

        let intensity_pct = fraction * target_pct;
        LightIntensity {
            fraction: intensity_pct,
            state: if intensity_pct > 0.0 { 1 } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PhotoperiodConfig {
        PhotoperiodConfig {
            day_start: 6 * 3600,
            day_end: 22 * 3600,
            ramp_up: Duration::from_secs(30 * 60),
            ramp_down: Duration::from_secs(30 * 60),
        }
    }

    #[test]
    fn matches_scenario_5_ramp_points() {
        let c = cfg();
        let (up, down) = PhotoperiodEngine::reshape_ramps(&c);
        assert_eq!(up, c.ramp_up);

        let at = |hms: (u32, u32, u32)| hms.0 * 3600 + hms.1 * 60 + hms.2;
        let i_0615 = PhotoperiodEngine::intensity_at(&c, up, down, at((6, 15, 0)), 80.0);
        assert!((i_0615.fraction - 40.0).abs() < 0.5, "{}", i_0615.fraction);

        let i_0630 = PhotoperiodEngine::intensity_at(&c, up, down, at((6, 30, 0)), 80.0);
        assert!((i_0630.fraction - 80.0).abs() < 0.5);

        let i_2130 = PhotoperiodEngine::intensity_at(&c, up, down, at((21, 30, 0)), 80.0);
        assert!((i_2130.fraction - 80.0).abs() < 0.5);

        let i_2145 = PhotoperiodEngine::intensity_at(&c, up, down, at((21, 45, 0)), 80.0);
        assert!((i_2145.fraction - 40.0).abs() < 0.5);

        let i_2200 = PhotoperiodEngine::intensity_at(&c, up, down, at((22, 0, 0)), 80.0);
        assert!(i_2200.fraction < 0.5);
    }

    #[test]
    fn night_is_fully_off() {
        let c = cfg();
        let (up, down) = PhotoperiodEngine::reshape_ramps(&c);
        let midnight = PhotoperiodEngine::intensity_at(&c, up, down, 0, 80.0);
        assert_eq!(midnight.state, 0);
    }

    #[test]
    fn overlapping_ramps_are_reshaped_to_meet_at_midpoint() {
        let c = PhotoperiodConfig {
            day_start: 6 * 3600,
            day_end: (6 * 3600) + 20 * 60, // 20 minute photoperiod
            ramp_up: Duration::from_secs(30 * 60),
            ramp_down: Duration::from_secs(30 * 60),
        };
        let (up, down) = PhotoperiodEngine::reshape_ramps(&c);
        let total = up.as_secs_f64() + down.as_secs_f64();
        assert!(total <= 20.0 * 60.0 + 1.0);
    }
}
