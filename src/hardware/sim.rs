//! Simulation variant of the hardware adapter (spec §4.8): in-memory
//! mirror of the relay/DAC state, timestamps every operation, never fails.
//! Selected via `hardware.simulation = true` (spec §6).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::HardwareError;
use crate::hardware::adapter::{DacBus, RelayBus};

struct Op {
    at_ms: i64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Default)]
pub struct SimulatedBus {
    relays: Mutex<[bool; 16]>,
    dac: Mutex<HashMap<(String, u8), f64>>,
    last_op: Mutex<Option<Op>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relay_word(&self) -> u16 {
        let relays = self.relays.lock().unwrap();
        relays
            .iter()
            .enumerate()
            .fold(0u16, |word, (i, &on)| if on { word | (1 << i) } else { word })
    }

    fn stamp(&self) {
        *self.last_op.lock().unwrap() = Some(Op { at_ms: now_ms() });
    }
}

#[async_trait]
impl RelayBus for SimulatedBus {
    async fn set_channel(&self, channel: u8, on: bool) -> Result<(), HardwareError> {
        let mut relays = self.relays.lock().unwrap();
        relays[channel as usize] = on;
        drop(relays);
        self.stamp();
        Ok(())
    }

    async fn get_channel(&self, channel: u8) -> Result<bool, HardwareError> {
        Ok(self.relays.lock().unwrap()[channel as usize])
    }

    async fn commit_all(&self, word: u16) -> Result<(), HardwareError> {
        let mut relays = self.relays.lock().unwrap();
        for i in 0..16u8 {
            relays[i as usize] = word & (1 << i) != 0;
        }
        drop(relays);
        self.stamp();
        Ok(())
    }
}

#[async_trait]
impl DacBus for SimulatedBus {
    async fn set_percent(&self, board_id: &str, dac_channel: u8, percent: f64) -> Result<(), HardwareError> {
        self.dac
            .lock()
            .unwrap()
            .insert((board_id.to_string(), dac_channel), percent.clamp(0.0, 100.0));
        self.stamp();
        Ok(())
    }

    async fn set_voltage(&self, board_id: &str, dac_channel: u8, volts: f64) -> Result<(), HardwareError> {
        self.set_percent(board_id, dac_channel, (volts.clamp(0.0, 10.0) / 10.0) * 100.0)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_all_sets_every_channel_from_word() {
        let bus = SimulatedBus::new();
        bus.commit_all(0b101).await.unwrap();
        assert!(bus.get_channel(0).await.unwrap());
        assert!(!bus.get_channel(1).await.unwrap());
        assert!(bus.get_channel(2).await.unwrap());
        assert_eq!(bus.relay_word(), 0b101);
    }

    #[tokio::test]
    async fn dac_percent_round_trips_via_voltage() {
        let bus = SimulatedBus::new();
        bus.set_voltage("board_a", 0, 5.0).await.unwrap();
        let pct = *bus.dac.lock().unwrap().get(&("board_a".to_string(), 0)).unwrap();
        assert!((pct - 50.0).abs() < 1e-9);
    }
}
