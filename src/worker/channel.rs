use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cache::Artifact;
use crate::error::{BrokerError, Result};
use crate::scheduler::{JobId, WorkerId};
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::protocol::{WorkerCall, WorkerEvent};
use crate::worker::proxy::{WorkerProxy, WorkerSpawner};

const CHANNEL_BUFFER: usize = 16;

/// Broker side of an in-process worker connected by tokio channels.
pub struct ChannelWorker {
    worker_id: WorkerId,
    calls_tx: mpsc::Sender<WorkerCall>,
    events_rx: Mutex<mpsc::Receiver<WorkerEvent>>,
    closed: CancellationToken,
}

/// Worker side of a [`ChannelWorker`]; whoever holds it plays the worker.
pub struct RemoteWorker {
    pub worker_id: WorkerId,
    calls_rx: mpsc::Receiver<WorkerCall>,
    events_tx: mpsc::Sender<WorkerEvent>,
    closed: CancellationToken,
}

impl ChannelWorker {
    pub fn pair(worker_id: WorkerId) -> (Self, RemoteWorker) {
        let (calls_tx, calls_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_BUFFER);
        let closed = CancellationToken::new();

        let proxy = Self {
            worker_id,
            calls_tx,
            events_rx: Mutex::new(events_rx),
            closed: closed.clone(),
        };
        let remote = RemoteWorker {
            worker_id,
            calls_rx,
            events_tx,
            closed,
        };
        (proxy, remote)
    }
}

#[async_trait]
impl WorkerProxy for ChannelWorker {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    async fn send(&self, call: &WorkerCall) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::WorkerLink(format!("worker {} is closed", self.worker_id)));
        }
        self.calls_tx
            .send(call.clone())
            .await
            .map_err(|_| BrokerError::WorkerLink(format!("worker {} hung up", self.worker_id)))
    }

    async fn receive(&self) -> Result<Option<WorkerEvent>> {
        let mut events = self.events_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            event = events.recv() => Ok(event),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

impl RemoteWorker {
    /// Next call from the broker, or `None` once the link is closed.
    pub async fn next_call(&mut self) -> Option<WorkerCall> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            call = self.calls_rx.recv() => call,
        }
    }

    pub async fn ready(&self) -> bool {
        self.events_tx.send(WorkerEvent::Ready).await.is_ok()
    }

    pub async fn heartbeat(&self) -> bool {
        self.events_tx.send(WorkerEvent::Heartbeat).await.is_ok()
    }

    pub async fn reply(&self, job_id: JobId, outcome: std::result::Result<Artifact, String>) -> bool {
        self.events_tx
            .send(WorkerEvent::Reply { job_id, outcome })
            .await
            .is_ok()
    }

    pub fn events(&self) -> mpsc::Sender<WorkerEvent> {
        self.events_tx.clone()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Spawns in-process workers that run `handler` for every call.
///
/// Each worker announces itself ready, heartbeats on `heartbeat_interval`
/// from a separate task (so long computations stay alive) and answers calls
/// one at a time.
pub struct InProcessSpawner<F> {
    handler: Arc<F>,
    heartbeat_interval: Duration,
}

impl<F, Fut> InProcessSpawner<F>
where
    F: Fn(WorkerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Artifact, String>> + Send + 'static,
{
    pub fn new(heartbeat_interval: Duration, handler: F) -> Self {
        Self {
            handler: Arc::new(handler),
            heartbeat_interval,
        }
    }
}

#[async_trait]
impl<F, Fut> WorkerSpawner for InProcessSpawner<F>
where
    F: Fn(WorkerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Artifact, String>> + Send + 'static,
{
    async fn spawn(&self, worker_id: WorkerId) -> Result<Arc<dyn WorkerProxy>> {
        let (proxy, mut remote) = ChannelWorker::pair(worker_id);
        let handler = self.handler.clone();

        let heartbeat = HeartbeatSender::new(self.heartbeat_interval);
        let events = remote.events();
        let closed = remote.closed_token();
        tokio::spawn(async move {
            heartbeat.run(events, closed, || true).await;
        });

        tokio::spawn(async move {
            if !remote.ready().await {
                return;
            }
            while let Some(call) = remote.next_call().await {
                let job_id = call.job_id;
                let outcome = handler(call).await;
                if !remote.reply(job_id, outcome).await {
                    break;
                }
            }
            tracing::debug!(worker_id, "In-process worker stopped");
        });

        Ok(Arc::new(proxy))
    }
}
