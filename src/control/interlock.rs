//! C11 Interlock Manager (spec §4.7).
//!
//! Applied after arbitration (spec §4.1 step 4): iteratively forces the
//! lower-priority side of each conflicting pair OFF until a pass makes no
//! further change, or `max_passes` is exceeded, in which case the affected
//! devices freeze at their current hardware state and an `interlock_cycle`
//! warning is raised (spec §4.9).

use std::collections::BTreeMap;

use crate::domain::{DeviceId, DeviceKind, Reason};

#[derive(Debug, Clone)]
pub struct InterlockRule {
    pub a: DeviceId,
    pub b: DeviceId,
    /// Configured winner override for this pair (spec §4.7: "the winner is
    /// configurable"). `None` falls back to the default heater-wins rule.
    pub priority: Option<DeviceId>,
}

/// Winner when both sides of a pair are candidate-ON. A configured
/// `priority` override on the rule always wins; otherwise a heater wins
/// over its partner by default (spec §4.7: "default: the heater in
/// heater<->exhaust_fan pairs"), and failing that the lexicographically
/// lower device id wins, which is deterministic and satisfies I1 without
/// depending on iteration order.
fn winner<'a>(rule: &'a InterlockRule, a: (&'a DeviceId, DeviceKind), b: (&'a DeviceId, DeviceKind)) -> &'a DeviceId {
    if let Some(priority) = &rule.priority {
        return if priority == a.0 { a.0 } else { b.0 };
    }
    let a_heater = matches!(a.1, DeviceKind::Heater);
    let b_heater = matches!(b.1, DeviceKind::Heater);
    if a_heater && !b_heater {
        a.0
    } else if b_heater && !a_heater {
        b.0
    } else {
        a.0.min(b.0)
    }
}

pub struct InterlockCycleWarning {
    pub passes: u8,
}

pub struct InterlockManager {
    rules: Vec<InterlockRule>,
    max_passes: u8,
}

impl InterlockManager {
    pub fn new(rules: Vec<InterlockRule>, max_passes: u8) -> Self {
        Self { rules, max_passes }
    }

    /// Iteratively resolves conflicts in `candidates` (device -> ON/OFF),
    /// mutating it in place and reassigning `reasons` to `interlock` for
    /// every device it forces OFF. On non-convergence within `max_passes`,
    /// every device touched by a still-conflicting pair is reset to its
    /// value in `current_states` instead.
    pub fn apply(
        &self,
        candidates: &mut BTreeMap<DeviceId, u8>,
        reasons: &mut BTreeMap<DeviceId, Reason>,
        kinds: &BTreeMap<DeviceId, DeviceKind>,
        current_states: &BTreeMap<DeviceId, u8>,
    ) -> Option<InterlockCycleWarning> {
        if self.rules.is_empty() {
            return None;
        }

        for pass in 1..=self.max_passes {
            let mut changed = false;
            for rule in &self.rules {
                let (Some(&state_a), Some(&state_b)) = (candidates.get(&rule.a), candidates.get(&rule.b)) else {
                    continue;
                };
                if state_a == 1 && state_b == 1 {
                    let kind_a = kinds.get(&rule.a).copied().unwrap_or(DeviceKind::Heater);
                    let kind_b = kinds.get(&rule.b).copied().unwrap_or(DeviceKind::Heater);
                    let loser = if winner(rule, (&rule.a, kind_a), (&rule.b, kind_b)) == &rule.a {
                        &rule.b
                    } else {
                        &rule.a
                    };
                    if candidates.get(loser) != Some(&0) {
                        candidates.insert(loser.clone(), 0);
                        reasons.insert(loser.clone(), Reason::Interlock);
                        changed = true;
                    }
                }
            }
            if !changed {
                return None;
            }
            if pass == self.max_passes {
                tracing::warn!(passes = pass, "interlock resolution did not converge, freezing affected devices");
                for rule in &self.rules {
                    if let Some(&current) = current_states.get(&rule.a) {
                        candidates.insert(rule.a.clone(), current);
                    }
                    if let Some(&current) = current_states.get(&rule.b) {
                        candidates.insert(rule.b.clone(), current);
                    }
                }
                return Some(InterlockCycleWarning { passes: pass });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ZoneId;

    fn id(name: &str) -> DeviceId {
        DeviceId::new(ZoneId::new("Flower", "front"), name)
    }

    #[test]
    fn scenario_3_heater_loses_to_exhaust_fan_priority() {
        let heater = id("heater_1");
        let fan = id("exhaust_fan");
        let mgr = InterlockManager::new(
            vec![InterlockRule {
                a: fan.clone(),
                b: heater.clone(),
                priority: Some(fan.clone()),
            }],
            8,
        );
        let mut candidates = BTreeMap::new();
        candidates.insert(heater.clone(), 1);
        candidates.insert(fan.clone(), 1);
        let mut reasons = BTreeMap::new();
        let mut kinds = BTreeMap::new();
        kinds.insert(heater.clone(), DeviceKind::Heater);
        kinds.insert(fan.clone(), DeviceKind::ExhaustFan);

        let warning = mgr.apply(&mut candidates, &mut reasons, &kinds, &BTreeMap::new());
        assert!(warning.is_none());
        assert_eq!(candidates[&heater], 0);
        assert_eq!(candidates[&fan], 1);
        assert_eq!(reasons[&heater], Reason::Interlock);
    }

    #[test]
    fn default_heater_wins_without_priority_override() {
        let heater = id("heater_1");
        let fan = id("exhaust_fan");
        let mgr = InterlockManager::new(
            vec![InterlockRule {
                a: fan.clone(),
                b: heater.clone(),
                priority: None,
            }],
            8,
        );
        let mut candidates = BTreeMap::new();
        candidates.insert(heater.clone(), 1);
        candidates.insert(fan.clone(), 1);
        let mut reasons = BTreeMap::new();
        let mut kinds = BTreeMap::new();
        kinds.insert(heater.clone(), DeviceKind::Heater);
        kinds.insert(fan.clone(), DeviceKind::ExhaustFan);

        mgr.apply(&mut candidates, &mut reasons, &kinds, &BTreeMap::new());
        assert_eq!(candidates[&heater], 1);
        assert_eq!(candidates[&fan], 0);
    }

    #[test]
    fn i3_never_both_on_after_commit() {
        let a = id("a");
        let b = id("b");
        let mgr = InterlockManager::new(
            vec![InterlockRule {
                a: a.clone(),
                b: b.clone(),
                priority: None,
            }],
            8,
        );
        let mut candidates = BTreeMap::new();
        candidates.insert(a.clone(), 1);
        candidates.insert(b.clone(), 1);
        let mut reasons = BTreeMap::new();
        let kinds = BTreeMap::new();
        mgr.apply(&mut candidates, &mut reasons, &kinds, &BTreeMap::new());
        assert!(!(candidates[&a] == 1 && candidates[&b] == 1));
    }
}
