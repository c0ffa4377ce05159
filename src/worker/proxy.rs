use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::scheduler::WorkerId;
use crate::worker::protocol::{WorkerCall, WorkerEvent};

/// Duplex channel to one worker.
///
/// `send` and `receive` may run concurrently from different tasks; ordering
/// is only guaranteed within one channel.
#[async_trait]
pub trait WorkerProxy: Send + Sync {
    fn worker_id(&self) -> WorkerId;

    async fn send(&self, call: &WorkerCall) -> Result<()>;

    /// Next event from the worker, or `None` once the channel is closed.
    async fn receive(&self) -> Result<Option<WorkerEvent>>;

    async fn close(&self) -> Result<()>;
}

/// Creates the proxy for a freshly reserved worker id.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, worker_id: WorkerId) -> Result<Arc<dyn WorkerProxy>>;
}
