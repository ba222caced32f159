//! C9 Rules Engine (spec §4.1 step 3.2).

use std::time::Duration;

use crate::sensors::cache::SensorReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
}

impl ConditionOperator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "<" => Self::Lt,
            ">" => Self::Gt,
            "<=" => Self::Le,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            _ => return None,
        })
    }

    fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => value < threshold,
            Self::Gt => value > threshold,
            Self::Le => value <= threshold,
            Self::Ge => value >= threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: u64,
    pub enabled: bool,
    pub condition_sensor: String,
    pub condition_operator: ConditionOperator,
    pub condition_value: f64,
    pub action_device: String,
    pub action_state: u8,
    pub priority: u8,
    pub schedule_id: Option<u64>,
}

impl Rule {
    /// Whether this rule's condition currently holds, given a reading for
    /// its sensor that must be fresh (spec §4.1 step 3.2: "the referenced
    /// sensor is fresh", I6). A missing or stale reading never matches.
    fn matches(&self, reading: Option<&SensorReading>, last_good_hold_period: Duration) -> bool {
        self.enabled
            && reading
                .filter(|r| r.is_fresh_enough(last_good_hold_period))
                .map(|r| self.condition_operator.evaluate(r.value, self.condition_value))
                .unwrap_or(false)
    }
}

pub struct RulesEngine;

impl RulesEngine {
    /// Picks the winning rule for `device_name` among `rules` already
    /// filtered to the zone and to schedule-gate-passing rules, keyed by
    /// `sensor_reading(condition_sensor)`. Ties break by lowest rule id
    /// (spec §4.1 step 3.2). `last_good_hold_period` gates matches on
    /// reading freshness (I6): a `Db`-sourced or stale reading never wins.
    pub fn evaluate<'a>(
        rules: &'a [Rule],
        device_name: &str,
        last_good_hold_period: Duration,
        sensor_reading: impl Fn(&str) -> Option<SensorReading>,
    ) -> Option<&'a Rule> {
        rules
            .iter()
            .filter(|r| r.action_device == device_name)
            .filter(|r| {
                let reading = sensor_reading(&r.condition_sensor);
                r.matches(reading.as_ref(), last_good_hold_period)
            })
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
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
    fn highest_priority_rule_wins_ties_broken_by_lowest_id() {
        let rules = vec![
            Rule {
                id: 2,
                enabled: true,
                condition_sensor: "dry_bulb_f".into(),
                condition_operator: ConditionOperator::Gt,
                condition_value: 20.0,
                action_device: "exhaust_fan".into(),
                action_state: 1,
                priority: 50,
                schedule_id: None,
            },
            Rule {
                id: 1,
                enabled: true,
                condition_sensor: "dry_bulb_f".into(),
                condition_operator: ConditionOperator::Gt,
                condition_value: 20.0,
                action_device: "exhaust_fan".into(),
                action_state: 1,
                priority: 50,
                schedule_id: None,
            },
        ];
        let winner = RulesEngine::evaluate(&rules, "exhaust_fan", Duration::from_secs(300), |_| Some(reading(29.0))).unwrap();
        assert_eq!(winner.id, 1);
    }

    #[test]
    fn missing_sensor_never_matches() {
        let rules = vec![Rule {
            id: 1,
            enabled: true,
            condition_sensor: "dry_bulb_f".into(),
            condition_operator: ConditionOperator::Gt,
            condition_value: 20.0,
            action_device: "exhaust_fan".into(),
            action_state: 1,
            priority: 50,
            schedule_id: None,
        }];
        assert!(RulesEngine::evaluate(&rules, "exhaust_fan", Duration::from_secs(300), |_| None).is_none());
    }

    #[test]
    fn scenario_2_rule_beats_schedule_off() {
        let rules = vec![Rule {
            id: 1,
            enabled: true,
            condition_sensor: "dry_bulb_f".into(),
            condition_operator: ConditionOperator::Gt,
            condition_value: 28.0,
            action_device: "exhaust_fan".into(),
            action_state: 1,
            priority: 50,
            schedule_id: None,
        }];
        let winner = RulesEngine::evaluate(&rules, "exhaust_fan", Duration::from_secs(300), |_| Some(reading(29.0)));
        assert!(winner.is_some());
    }

    #[test]
    fn stale_db_reading_never_matches() {
        let rules = vec![Rule {
            id: 1,
            enabled: true,
            condition_sensor: "dry_bulb_f".into(),
            condition_operator: ConditionOperator::Gt,
            condition_value: 20.0,
            action_device: "exhaust_fan".into(),
            action_state: 1,
            priority: 50,
            schedule_id: None,
        }];
        let stale = SensorReading {
            value: 29.0,
            source: SensorSource::Db,
            age: Duration::from_secs(60),
        };
        assert!(RulesEngine::evaluate(&rules, "exhaust_fan", Duration::from_secs(300), |_| Some(stale.clone())).is_none());
    }
}
