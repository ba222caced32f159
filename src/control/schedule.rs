//! C10 Schedule Engine (spec §4.1 step 3.3, B1, B2).

use crate::timeutil::{self, TimeOfDay};

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: u64,
    pub device_name: String,
    pub day_of_week: Option<u8>,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub enabled: bool,
    pub target_intensity: Option<f64>,
}

impl Schedule {
    /// Active at `(t, dow)` iff enabled, the day matches (`day_of_week ==
    /// None` means daily), and `t` falls in `[start_time, end_time)` with
    /// midnight wraparound when `end_time <= start_time` (B1: `start ==
    /// end` is empty, handled by `in_window`'s zero-length rule since
    /// `duration_seconds(start, start) == 0`).
    pub fn is_active(&self, t: TimeOfDay, dow: u8) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(d) = self.day_of_week {
            if d != dow {
                return false;
            }
        }
        let len = timeutil::duration_seconds(self.start_time, self.end_time);
        timeutil::in_window(t, self.start_time, len)
    }
}

pub struct ScheduleEngine;

impl ScheduleEngine {
    /// Whether any of `schedules` (already filtered to one device) is
    /// active at `(t, dow)`.
    pub fn any_active(schedules: &[&Schedule], t: TimeOfDay, dow: u8) -> bool {
        schedules.iter().any(|s| s.is_active(t, dow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(start: u32, end: u32) -> Schedule {
        Schedule {
            id: 1,
            device_name: "exhaust_fan".into(),
            day_of_week: None,
            start_time: start,
            end_time: end,
            enabled: true,
            target_intensity: None,
        }
    }

    #[test]
    fn b1_equal_start_end_is_never_active() {
        let s = schedule(8 * 3600, 8 * 3600);
        assert!(!s.is_active(8 * 3600, 3));
        assert!(!s.is_active(0, 3));
    }

    #[test]
    fn b2_midnight_crossing_is_active_on_either_side() {
        let s = schedule(22 * 3600, 2 * 3600);
        assert!(s.is_active(23 * 3600, 3));
        assert!(s.is_active(3600, 3));
        assert!(!s.is_active(12 * 3600, 3));
    }

    #[test]
    fn day_of_week_gate() {
        let mut s = schedule(8 * 3600, 20 * 3600);
        s.day_of_week = Some(2);
        assert!(s.is_active(9 * 3600, 2));
        assert!(!s.is_active(9 * 3600, 3));
    }

    #[test]
    fn disabled_schedule_is_never_active() {
        let mut s = schedule(8 * 3600, 20 * 3600);
        s.enabled = false;
        assert!(!s.is_active(9 * 3600, 2));
    }
}
