//! C3 Hardware Adapter contract (spec §4.8).
//!
//! A relay expander (16 channels, ON/OFF) and a 0–10 V DAC, each behind a
//! narrow trait so the Relay Manager (C4) is agnostic to whether it is
//! talking to the real I2C bus or `SimulatedBus`.

use async_trait::async_trait;

use crate::error::HardwareError;

/// 16-channel relay expander: per-channel set/clear/get, plus a
/// `commit_all` that writes the full 16-bit word in one bus transaction
/// (spec §4.8).
#[async_trait]
pub trait RelayBus: Send + Sync {
    async fn set_channel(&self, channel: u8, on: bool) -> Result<(), HardwareError>;
    async fn get_channel(&self, channel: u8) -> Result<bool, HardwareError>;
    async fn commit_all(&self, word: u16) -> Result<(), HardwareError>;
}

/// 0–10 V DAC, addressed per call by `(board_id, dac_channel)`.
#[async_trait]
pub trait DacBus: Send + Sync {
    async fn set_percent(&self, board_id: &str, dac_channel: u8, percent: f64) -> Result<(), HardwareError>;
    async fn set_voltage(&self, board_id: &str, dac_channel: u8, volts: f64) -> Result<(), HardwareError>;
}

/// Retry policy shared by real bus implementations (spec §4.8: transient
/// errors retried up to 3 times with 50 ms backoff).
pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);

/// Runs `op` up to `RETRY_ATTEMPTS` times, sleeping `RETRY_BACKOFF` between
/// attempts, converting a persistent failure into
/// `HardwareError::PersistentFault`.
pub async fn with_retry<F, Fut, T>(channel: u8, mut op: F) -> Result<T, HardwareError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, HardwareError>>,
{
    let mut last_message = String::new();
    for attempt in 1..=RETRY_ATTEMPTS {
        match op().await {
            Ok(v) => return Ok(v),
            Err(HardwareError::Transient { message, .. }) => {
                last_message = message;
                if attempt < RETRY_ATTEMPTS {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(HardwareError::PersistentFault {
        channel,
        attempts: RETRY_ATTEMPTS,
        message: last_message,
    })
}
