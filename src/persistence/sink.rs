//! The persistent time-series/relational store capability (spec §6, §9).
//!
//! Modeled as a narrow `TimeseriesSink` trait rather than an ambient DB
//! client singleton, so C14 can be driven by an in-memory sink in tests and
//! by a real Postgres pool (feature `db`) in production.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{DeviceId, Reason};
use crate::error::PersistenceError;

/// One row appended to `automation_state` per device per tick (spec §4.1
/// step 6), best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationStateRow {
    pub device: DeviceId,
    pub timestamp_ms: i64,
    pub state: u8,
    pub mode: String,
    pub duty_cycle_pct: Option<f64>,
    pub pid_output_pct: Option<f64>,
    pub active_rule_id: Option<u64>,
    pub active_schedule_id: Option<u64>,
    pub reason: Reason,
}

/// One row appended to `control_history` on every state change (spec §4.1
/// step 6, I9): strictly increasing `sequence` per device, `old_state !=
/// new_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlHistoryRow {
    pub device: DeviceId,
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub old_state: u8,
    pub new_state: u8,
    pub reason: Reason,
    pub alarm_name: Option<String>,
}

/// Capability for writing control transitions and snapshots (spec §9
/// REDESIGN FLAGS: DB client as a narrow interface, not an ambient
/// singleton). Schedules/rules/setpoints/device-mapping reads are not part
/// of this trait — they are loaded once at startup via `ControlConfig` and
/// are out of scope per spec §1's Non-goals around the storage schema.
#[async_trait]
pub trait TimeseriesSink: Send + Sync {
    async fn write_automation_state(&self, row: AutomationStateRow) -> Result<(), PersistenceError>;
    async fn write_control_history(&self, row: ControlHistoryRow) -> Result<(), PersistenceError>;

    /// Last-resort sensor fallback used by C2 (spec §4.2 step 3): the
    /// latest DB point for `(zone, sensor_name)` within `lookback`, or
    /// `None` if nothing qualifies.
    async fn query_latest_sensor(
        &self,
        zone: &crate::domain::ZoneId,
        sensor_name: &str,
        lookback: std::time::Duration,
    ) -> Result<Option<(f64, i64)>, PersistenceError>;
}

/// In-memory sink used in `simulation` mode and by tests; bounded, drops the
/// oldest record once full (spec §5 back-pressure policy) instead of ever
/// blocking the control worker.
pub struct InMemorySink {
    capacity: usize,
    automation_state: tokio::sync::Mutex<Vec<AutomationStateRow>>,
    control_history: tokio::sync::Mutex<Vec<ControlHistoryRow>>,
    /// Seeded sensor history for tests exercising the §4.2 step-3 DB
    /// fallback path: `(zone, sensor_name) -> (value, timestamp_ms)`.
    sensor_history: tokio::sync::Mutex<std::collections::HashMap<(crate::domain::ZoneId, String), (f64, i64)>>,
}

impl InMemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            automation_state: tokio::sync::Mutex::new(Vec::new()),
            control_history: tokio::sync::Mutex::new(Vec::new()),
            sensor_history: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn automation_state_rows(&self) -> Vec<AutomationStateRow> {
        self.automation_state.lock().await.clone()
    }

    pub async fn control_history_rows(&self) -> Vec<ControlHistoryRow> {
        self.control_history.lock().await.clone()
    }

    pub async fn seed_sensor(&self, zone: crate::domain::ZoneId, sensor_name: &str, value: f64, timestamp_ms: i64) {
        self.sensor_history
            .lock()
            .await
            .insert((zone, sensor_name.to_string()), (value, timestamp_ms));
    }
}

impl Clone for AutomationStateRow {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            timestamp_ms: self.timestamp_ms,
            state: self.state,
            mode: self.mode.clone(),
            duty_cycle_pct: self.duty_cycle_pct,
            pid_output_pct: self.pid_output_pct,
            active_rule_id: self.active_rule_id,
            active_schedule_id: self.active_schedule_id,
            reason: self.reason,
        }
    }
}

impl Clone for ControlHistoryRow {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            sequence: self.sequence,
            timestamp_ms: self.timestamp_ms,
            old_state: self.old_state,
            new_state: self.new_state,
            reason: self.reason,
            alarm_name: self.alarm_name.clone(),
        }
    }
}

#[async_trait]
impl TimeseriesSink for InMemorySink {
    async fn write_automation_state(&self, row: AutomationStateRow) -> Result<(), PersistenceError> {
        let mut rows = self.automation_state.lock().await;
        if rows.len() >= self.capacity {
            rows.remove(0);
        }
        rows.push(row);
        Ok(())
    }

    async fn write_control_history(&self, row: ControlHistoryRow) -> Result<(), PersistenceError> {
        let mut rows = self.control_history.lock().await;
        if rows.len() >= self.capacity {
            rows.remove(0);
        }
        rows.push(row);
        Ok(())
    }

    async fn query_latest_sensor(
        &self,
        zone: &crate::domain::ZoneId,
        sensor_name: &str,
        lookback: std::time::Duration,
    ) -> Result<Option<(f64, i64)>, PersistenceError> {
        let history = self.sensor_history.lock().await;
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Ok(history
            .get(&(zone.clone(), sensor_name.to_string()))
            .copied()
            .filter(|(_, ts)| now_ms - ts <= lookback.as_millis() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> ControlHistoryRow {
        ControlHistoryRow {
            device: DeviceId::new(crate::domain::ZoneId::new("Flower", "front"), "heater_1"),
            sequence: 1,
            timestamp_ms: 0,
            old_state: 0,
            new_state: 1,
            reason: Reason::Pid,
            alarm_name: None,
        }
    }

    #[tokio::test]
    async fn drops_oldest_beyond_capacity() {
        let sink = InMemorySink::new(2);
        for i in 0..5 {
            let mut row = sample_row();
            row.sequence = i;
            sink.write_control_history(row).await.unwrap();
        }
        let rows = sink.control_history_rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sequence, 3);
        assert_eq!(rows[1].sequence, 4);
    }
}
