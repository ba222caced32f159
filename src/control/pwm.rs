//! C6 PWM Scheduler (spec §4.3).
//!
//! Converts a PID's 0–100% output into a time-based duty cycle over a
//! configurable period. Each device owns a phase clock that starts at
//! first enable and only advances on period rollover — recomputing the
//! duty cycle mid-period never restarts the clock.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::domain::DeviceId;

#[derive(Debug, Clone, Copy)]
pub struct DutyCycle {
    pub on: bool,
    pub duty_cycle_pct: f64,
}

struct PhaseClock {
    phase_start: Instant,
    period: Duration,
}

pub struct PwmScheduler {
    phases: BTreeMap<DeviceId, PhaseClock>,
    min_on: Duration,
    min_off: Duration,
}

impl PwmScheduler {
    pub fn new(min_on: Duration, min_off: Duration) -> Self {
        Self {
            phases: BTreeMap::new(),
            min_on,
            min_off,
        }
    }

    fn phase_elapsed(&mut self, device: &DeviceId, period: Duration, now: Instant) -> Duration {
        let clock = self
            .phases
            .entry(device.clone())
            .or_insert_with(|| PhaseClock {
                phase_start: now,
                period,
            });
        clock.period = period;
        let mut elapsed = now.saturating_duration_since(clock.phase_start);
        while elapsed >= clock.period && clock.period > Duration::ZERO {
            clock.phase_start += clock.period;
            elapsed = now.saturating_duration_since(clock.phase_start);
        }
        elapsed
    }

    /// Computes the device's current ON/OFF state and duty cycle for
    /// `u_pct` (spec §4.3): snaps `ton` to 0 or to the full period when
    /// either side of the split would be shorter than the configured
    /// minimum.
    pub fn duty_state(&mut self, device: &DeviceId, u_pct: f64, period: Duration, now: Instant) -> DutyCycle {
        let period_s = period.as_secs_f64();
        let ton = (u_pct.clamp(0.0, 100.0) / 100.0) * period_s;
        let toff = period_s - ton;

        let ton_snapped = if ton < self.min_on.as_secs_f64() {
            0.0
        } else if toff < self.min_off.as_secs_f64() {
            period_s
        } else {
            ton
        };

        let elapsed = self.phase_elapsed(device, period, now).as_secs_f64();
        DutyCycle {
            on: elapsed < ton_snapped,
            duty_cycle_pct: if period_s > 0.0 { (ton_snapped / period_s) * 100.0 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ZoneId;

    fn device() -> DeviceId {
        DeviceId::new(ZoneId::new("Flower", "front"), "heater_1")
    }

    #[test]
    fn on_for_ton_then_off_for_remainder() {
        let mut sched = PwmScheduler::new(Duration::from_secs(5), Duration::from_secs(5));
        let period = Duration::from_secs(100);
        let start = Instant::now();
        let d = device();

        let at_10s = sched.duty_state(&d, 75.0, period, start + Duration::from_secs(10));
        assert!(at_10s.on);
        let at_80s = sched.duty_state(&d, 75.0, period, start + Duration::from_secs(80));
        assert!(!at_80s.on);
    }

    #[test]
    fn zero_output_snaps_fully_off() {
        let mut sched = PwmScheduler::new(Duration::from_secs(5), Duration::from_secs(5));
        let period = Duration::from_secs(100);
        let start = Instant::now();
        let d = device();
        let below_min_on = sched.duty_state(&d, 2.0, period, start);
        assert_eq!(below_min_on.duty_cycle_pct, 0.0);
    }

    #[test]
    fn near_full_output_snaps_fully_on() {
        let mut sched = PwmScheduler::new(Duration::from_secs(5), Duration::from_secs(5));
        let period = Duration::from_secs(100);
        let start = Instant::now();
        let d = device();
        let near_full = sched.duty_state(&d, 97.0, period, start);
        assert_eq!(near_full.duty_cycle_pct, 100.0);
    }

    #[test]
    fn phase_clock_does_not_restart_on_recompute() {
        let mut sched = PwmScheduler::new(Duration::from_secs(5), Duration::from_secs(5));
        let period = Duration::from_secs(100);
        let start = Instant::now();
        let d = device();
        sched.duty_state(&d, 50.0, period, start + Duration::from_secs(40));
        // recompute with a different u mid-period; phase origin must be unchanged
        let recompute = sched.duty_state(&d, 90.0, period, start + Duration::from_secs(45));
        assert!(recompute.on);
    }
}
