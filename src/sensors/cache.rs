//! C2 Sensor Cache (spec §4.2).
//!
//! Read-only from the control engine's perspective: live → last-good → DB,
//! with write-through to last-good on a successful live read. Missing
//! sensors are reported, not guessed at — callers decide what "no reading"
//! means for their arbitration step (spec §4.2: "the device keeps its
//! previous state").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::domain::ZoneId;
use crate::persistence::TimeseriesSink;
use crate::statebus::StateBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorSource {
    Live,
    LastGood,
    Db,
}

#[derive(Debug, Clone, Copy)]
pub struct SensorReading {
    pub value: f64,
    pub source: SensorSource,
    pub age: Duration,
}

impl SensorReading {
    /// I6 (Freshness honesty): whether a reading is eligible to drive a
    /// PID or rule decision.
    pub fn is_fresh_enough(&self, last_good_hold_period: Duration) -> bool {
        matches!(self.source, SensorSource::Live | SensorSource::LastGood) && self.age <= last_good_hold_period
    }
}

/// Tracks, per `(zone, sensor_name)`, how long a sensor has been missing so
/// C12 can raise `sensor_missing`/`sensor_loss` at the configured
/// thresholds (spec §4.2, §4.9).
struct MissingTracker {
    first_missing_at: HashMap<(ZoneId, String), std::time::Instant>,
}

pub struct SensorCache {
    state_bus: Arc<dyn StateBus>,
    sink: Arc<dyn TimeseriesSink>,
    freshness_window: Duration,
    last_good_hold_period: Duration,
    max_db_lookback: Duration,
    missing: Mutex<MissingTracker>,
}

impl SensorCache {
    pub fn new(
        state_bus: Arc<dyn StateBus>,
        sink: Arc<dyn TimeseriesSink>,
        freshness_window: Duration,
        last_good_hold_period: Duration,
        max_db_lookback: Duration,
    ) -> Self {
        Self {
            state_bus,
            sink,
            freshness_window,
            last_good_hold_period,
            max_db_lookback,
            missing: Mutex::new(MissingTracker {
                first_missing_at: HashMap::new(),
            }),
        }
    }

    /// Implements spec §4.2 steps 1–4 in order, writing through to
    /// last-good on a live hit.
    pub async fn read(&self, zone: &ZoneId, sensor_name: &str) -> Option<SensorReading> {
        let live_key = format!("sensor:{sensor_name}");
        if let Ok(Some(v)) = self.state_bus.get_value(&live_key).await {
            let age = self.age_of(v.written_at_ms);
            if age <= self.freshness_window {
                let last_good_key = format!("sensor:{zone}:{sensor_name}:last_good");
                let _ = self
                    .state_bus
                    .set_value(&last_good_key, v.value, self.last_good_hold_period)
                    .await;
                self.clear_missing(zone, sensor_name).await;
                return Some(SensorReading {
                    value: v.value,
                    source: SensorSource::Live,
                    age,
                });
            }
        }

        let last_good_key = format!("sensor:{zone}:{sensor_name}:last_good");
        if let Ok(Some(v)) = self.state_bus.get_value(&last_good_key).await {
            let age = self.age_of(v.written_at_ms);
            if age <= self.last_good_hold_period {
                self.clear_missing(zone, sensor_name).await;
                return Some(SensorReading {
                    value: v.value,
                    source: SensorSource::LastGood,
                    age,
                });
            }
        }

        if let Ok(Some((value, ts))) = self
            .sink
            .query_latest_sensor(zone, sensor_name, self.max_db_lookback)
            .await
        {
            self.clear_missing(zone, sensor_name).await;
            return Some(SensorReading {
                value,
                source: SensorSource::Db,
                age: self.age_of(ts),
            });
        }

        self.mark_missing(zone, sensor_name).await;
        None
    }

    fn age_of(&self, written_at_ms: i64) -> Duration {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Duration::from_millis((now_ms - written_at_ms).max(0) as u64)
    }

    async fn mark_missing(&self, zone: &ZoneId, sensor_name: &str) {
        let mut missing = self.missing.lock().await;
        missing
            .first_missing_at
            .entry((zone.clone(), sensor_name.to_string()))
            .or_insert_with(std::time::Instant::now);
    }

    async fn clear_missing(&self, zone: &ZoneId, sensor_name: &str) {
        let mut missing = self.missing.lock().await;
        missing
            .first_missing_at
            .remove(&(zone.clone(), sensor_name.to_string()));
    }

    /// The I6 freshness ceiling callers must gate reads on before driving a
    /// rule or PID decision (`SensorReading::is_fresh_enough`).
    pub fn last_good_hold_period(&self) -> Duration {
        self.last_good_hold_period
    }

    /// Duration a sensor has been continuously missing, or `None` if it is
    /// currently readable. Drives the `sensor_missing`/`sensor_loss`
    /// thresholds in C12.
    pub async fn missing_duration(&self, zone: &ZoneId, sensor_name: &str) -> Option<Duration> {
        let missing = self.missing.lock().await;
        missing
            .first_missing_at
            .get(&(zone.clone(), sensor_name.to_string()))
            .map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::sink::InMemorySink;
    use crate::statebus::InMemoryStateBus;

    fn zone() -> ZoneId {
        ZoneId::new("Flower", "front")
    }

    #[tokio::test]
    async fn reads_live_and_writes_through_to_last_good() {
        let bus = Arc::new(InMemoryStateBus::new());
        let sink = Arc::new(InMemorySink::new(10));
        let cache = SensorCache::new(
            bus.clone(),
            sink,
            Duration::from_secs(30),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        bus.set_value("sensor:dry_bulb_f", 22.0, Duration::from_secs(30))
            .await
            .unwrap();

        let reading = cache.read(&zone(), "dry_bulb_f").await.unwrap();
        assert_eq!(reading.source, SensorSource::Live);
        assert_eq!(reading.value, 22.0);

        let last_good = bus
            .get_value("sensor:Flower/front:dry_bulb_f:last_good")
            .await
            .unwrap();
        assert!(last_good.is_some());
    }

    #[tokio::test]
    async fn falls_back_to_db_when_live_and_last_good_absent() {
        let bus = Arc::new(InMemoryStateBus::new());
        let sink = Arc::new(InMemorySink::new(10));
        sink.seed_sensor(zone(), "co2_ppm", 850.0, 0).await;

        let cache = SensorCache::new(
            bus,
            sink,
            Duration::from_secs(30),
            Duration::from_secs(30),
            Duration::from_secs(600),
        );
        let reading = cache.read(&zone(), "co2_ppm").await.unwrap();
        assert_eq!(reading.source, SensorSource::Db);
    }

    #[tokio::test]
    async fn missing_sensor_tracked_until_cleared() {
        let bus = Arc::new(InMemoryStateBus::new());
        let sink = Arc::new(InMemorySink::new(10));
        let cache = SensorCache::new(
            bus.clone(),
            sink,
            Duration::from_secs(30),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        assert!(cache.read(&zone(), "dry_bulb_f").await.is_none());
        assert!(cache.missing_duration(&zone(), "dry_bulb_f").await.is_some());

        bus.set_value("sensor:dry_bulb_f", 21.0, Duration::from_secs(30))
            .await
            .unwrap();
        cache.read(&zone(), "dry_bulb_f").await.unwrap();
        assert!(cache.missing_duration(&zone(), "dry_bulb_f").await.is_none());
    }
}
