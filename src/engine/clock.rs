//! C1 Clock & Tick Source (spec §2, §5).
//!
//! A tick has a soft deadline equal to the tick period: a tick that misses
//! it is logged and the *next* tick is skipped rather than queued up behind
//! it, which is exactly `tokio::time::MissedTickBehavior::Skip`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::{self, Interval, MissedTickBehavior};

#[async_trait]
pub trait TickSource: Send {
    /// Awaits the next tick and returns its nominal period (so a caller can
    /// clamp PID `dt` against it).
    async fn tick(&mut self) -> Instant;

    fn period(&self) -> Duration;
}

pub struct RealClock {
    interval: Interval,
    period: Duration,
}

impl RealClock {
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval, period }
    }
}

#[async_trait]
impl TickSource for RealClock {
    async fn tick(&mut self) -> Instant {
        self.interval.tick().await;
        Instant::now()
    }

    fn period(&self) -> Duration {
        self.period
    }
}
