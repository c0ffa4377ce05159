use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::worker::protocol::WorkerEvent;

/// Heartbeat sender that periodically reports a worker as alive
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Send `WorkerEvent::Heartbeat` on every tick while `is_alive` holds.
    ///
    /// Stops once `is_alive` returns false, on cancellation, or when the receiver drops.
    pub async fn run<F>(&self, tx: mpsc::Sender<WorkerEvent>, cancel: CancellationToken, is_alive: F)
    where
        F: Fn() -> bool + Send,
    {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !is_alive() {
                        break;
                    }
                    if tx.send(WorkerEvent::Heartbeat).await.is_err() {
                        // Receiver dropped, stop sending
                        break;
                    }
                }
            }
        }
    }
}
