//! Real-time state bus capability (spec §6, §9 REDESIGN FLAGS).
//!
//! The source treats a Redis client as an ambient singleton; here it is a
//! narrow trait passed explicitly to whatever needs it (C2, C14, the PID
//! parameter cache), so the backing store is swappable between the sim
//! implementation and a real Redis client behind the `redis-bus` feature.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::error::StateBusError;

/// A single key's value plus the millisecond timestamp it was written at,
/// mirroring the `sensor:<name>` / `sensor:<name>:ts` key pair (spec §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampedValue {
    pub value: f64,
    pub written_at_ms: i64,
}

/// Narrow capability covering everything C2/C14/the PID cache need from the
/// real-time store: get/set of scalar keys, JSON blobs, and stream append.
/// `get`/`set` calls carry an implicit per-call deadline enforced by the
/// concrete implementation (spec §5: default 50 ms for state-bus reads).
#[async_trait]
pub trait StateBus: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<TimestampedValue>, StateBusError>;
    async fn set_value(&self, key: &str, value: f64, ttl: Duration) -> Result<(), StateBusError>;
    async fn get_json(&self, key: &str) -> Result<Option<String>, StateBusError>;
    async fn set_json(&self, key: &str, json: &str, ttl: Duration) -> Result<(), StateBusError>;
    async fn append_stream(&self, stream: &str, json: &str) -> Result<(), StateBusError>;
    async fn heartbeat(&self, key: &str, ttl: Duration) -> Result<(), StateBusError>;
}

struct Entry {
    payload: EntryPayload,
    expires_at_ms: i64,
}

enum EntryPayload {
    Value(TimestampedValue),
    Json(String),
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// In-memory `StateBus` used in `simulation` mode and by tests. TTLs are
/// honored on read (a stale entry reads back as `None`, matching real Redis
/// expiry semantics) rather than swept eagerly.
#[derive(Default)]
pub struct InMemoryStateBus {
    entries: Mutex<HashMap<String, Entry>>,
    streams: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryStateBus {
    pub fn new() -> Self {
        Self::default()
    }

    const MAX_STREAM_LEN: usize = 100_000;
}

#[async_trait]
impl StateBus for InMemoryStateBus {
    async fn get_value(&self, key: &str) -> Result<Option<TimestampedValue>, StateBusError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).and_then(|e| {
            if e.expires_at_ms > now_ms() {
                match e.payload {
                    EntryPayload::Value(v) => Some(v),
                    EntryPayload::Json(_) => None,
                }
            } else {
                None
            }
        }))
    }

    async fn set_value(&self, key: &str, value: f64, ttl: Duration) -> Result<(), StateBusError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                payload: EntryPayload::Value(TimestampedValue {
                    value,
                    written_at_ms: now_ms(),
                }),
                expires_at_ms: now_ms() + ttl.as_millis() as i64,
            },
        );
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<String>, StateBusError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).and_then(|e| {
            if e.expires_at_ms > now_ms() {
                match &e.payload {
                    EntryPayload::Json(j) => Some(j.clone()),
                    EntryPayload::Value(_) => None,
                }
            } else {
                None
            }
        }))
    }

    async fn set_json(&self, key: &str, json: &str, ttl: Duration) -> Result<(), StateBusError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                payload: EntryPayload::Json(json.to_string()),
                expires_at_ms: now_ms() + ttl.as_millis() as i64,
            },
        );
        Ok(())
    }

    async fn append_stream(&self, stream: &str, json: &str) -> Result<(), StateBusError> {
        let mut streams = self.streams.lock().await;
        let entries = streams.entry(stream.to_string()).or_default();
        entries.push(json.to_string());
        if entries.len() > Self::MAX_STREAM_LEN {
            let overflow = entries.len() - Self::MAX_STREAM_LEN;
            entries.drain(0..overflow);
        }
        Ok(())
    }

    async fn heartbeat(&self, key: &str, ttl: Duration) -> Result<(), StateBusError> {
        self.set_value(key, now_ms() as f64, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_value() {
        let bus = InMemoryStateBus::new();
        bus.set_value("sensor:dry_bulb_f", 22.5, Duration::from_secs(10))
            .await
            .unwrap();
        let got = bus.get_value("sensor:dry_bulb_f").await.unwrap().unwrap();
        assert_eq!(got.value, 22.5);
    }

    #[tokio::test]
    async fn expired_value_reads_as_missing() {
        let bus = InMemoryStateBus::new();
        bus.set_value("sensor:x", 1.0, Duration::from_millis(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(bus.get_value("sensor:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_append_caps_length() {
        let bus = InMemoryStateBus::new();
        for i in 0..5 {
            bus.append_stream("events", &format!("{{\"i\":{i}}}"))
                .await
                .unwrap();
        }
        let streams = bus.streams.lock().await;
        assert_eq!(streams.get("events").unwrap().len(), 5);
    }
}
