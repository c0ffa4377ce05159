use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::scheduler::WorkerId;
use crate::worker::{WorkerCall, WorkerEvent, WorkerProxy};

const LINK_BUFFER: usize = 4;

/// Messages reaching the broker loop from worker-side tasks.
pub enum LinkEvent {
    Started {
        worker_id: WorkerId,
        proxy: Arc<dyn WorkerProxy>,
    },
    SpawnFailed {
        worker_id: WorkerId,
        error: BrokerError,
    },
    Event {
        worker_id: WorkerId,
        event: WorkerEvent,
    },
    Closed {
        worker_id: WorkerId,
    },
}

/// Broker-owned connection to one running worker.
///
/// A writer task drains outgoing calls into the proxy and a reader task
/// forwards proxy events to the broker, so the broker loop never awaits
/// worker I/O. Dropping the link closes the worker.
pub struct WorkerLink {
    worker_id: WorkerId,
    calls_tx: mpsc::Sender<WorkerCall>,
    cancel: CancellationToken,
}

impl WorkerLink {
    pub fn open(proxy: Arc<dyn WorkerProxy>, events: mpsc::Sender<LinkEvent>) -> Self {
        let worker_id = proxy.worker_id();
        let (calls_tx, mut calls_rx) = mpsc::channel::<WorkerCall>(LINK_BUFFER);
        let cancel = CancellationToken::new();

        let writer_proxy = proxy.clone();
        let writer_events = events.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let call = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    call = calls_rx.recv() => call,
                };
                let Some(call) = call else { break };
                if let Err(e) = writer_proxy.send(&call).await {
                    tracing::warn!(worker_id, job_id = %call.job_id, error = %e, "Failed to send call to worker");
                    let _ = writer_events.send(LinkEvent::Closed { worker_id }).await;
                    break;
                }
            }
            if let Err(e) = writer_proxy.close().await {
                tracing::debug!(worker_id, error = %e, "Error while closing worker");
            }
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    received = proxy.receive() => received,
                };
                match received {
                    Ok(Some(event)) => {
                        if events.send(LinkEvent::Event { worker_id, event }).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = events.send(LinkEvent::Closed { worker_id }).await;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "Worker receive failed");
                        let _ = events.send(LinkEvent::Closed { worker_id }).await;
                        break;
                    }
                }
            }
        });

        Self {
            worker_id,
            calls_tx,
            cancel,
        }
    }

    /// Queue a call for the writer task without waiting.
    pub fn try_send(&self, call: WorkerCall) -> bool {
        match self.calls_tx.try_send(call) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(worker_id = self.worker_id, error = %e, "Worker link refused call");
                false
            }
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
