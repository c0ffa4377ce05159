use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::cache::Artifact;
use crate::catalog::FunctionCatalog;
use crate::error::{BrokerError, Result};
use crate::identity::ClientId;
use crate::scheduler::{Job, JobId};
use crate::worker::ClientRequest;

/// Final outcome delivered to the submitter of a job.
pub type JobOutcome = Result<Artifact>;

/// Requests accepted by the broker loop.
#[derive(Debug)]
pub enum BrokerMessage {
    Submit {
        job: Job,
        response_tx: oneshot::Sender<JobOutcome>,
    },
    Stats {
        response_tx: oneshot::Sender<BrokerStats>,
    },
}

/// Point-in-time view of the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
    pub pool_size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

/// Cloneable entry point into a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerMessage>,
    catalog: Arc<FunctionCatalog>,
}

impl BrokerHandle {
    pub(crate) fn new(tx: mpsc::Sender<BrokerMessage>, catalog: Arc<FunctionCatalog>) -> Self {
        Self { tx, catalog }
    }

    pub fn catalog(&self) -> &FunctionCatalog {
        &self.catalog
    }

    /// Submit a call under a fresh job id.
    ///
    /// Never waits: input errors and a saturated broker are reported
    /// immediately, everything else through the returned [`JobHandle`].
    pub fn submit(&self, function: &str, args: Value, client_id: ClientId) -> Result<JobHandle> {
        self.submit_request(ClientRequest {
            client_id,
            job_id: Uuid::new_v4(),
            function_name: function.to_string(),
            json_args: args,
        })
    }

    /// Submit a Client → Broker envelope, keeping its job id.
    pub fn submit_request(&self, request: ClientRequest) -> Result<JobHandle> {
        let call = self
            .catalog
            .build_call(&request.function_name, &request.json_args)?;
        let job = Job::with_id(request.job_id, call, request.client_id);
        let job_id = job.id;

        let (response_tx, rx) = oneshot::channel();
        match self.tx.try_send(BrokerMessage::Submit { job, response_tx }) {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, function = %request.function_name, "Job submitted");
                Ok(JobHandle { job_id, rx })
            }
            Err(TrySendError::Full(_)) => Err(BrokerError::Overloaded {
                depth: self.tx.max_capacity(),
            }),
            Err(TrySendError::Closed(_)) => Err(BrokerError::BrokerUnavailable),
        }
    }

    pub async fn stats(&self) -> Result<BrokerStats> {
        let (response_tx, rx) = oneshot::channel();
        self.tx
            .send(BrokerMessage::Stats { response_tx })
            .await
            .map_err(|_| BrokerError::BrokerUnavailable)?;
        rx.await.map_err(|_| BrokerError::BrokerUnavailable)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Resolves with the result of one submitted job.
///
/// Dropping the handle withdraws interest; the broker then discards the
/// job's reply when it arrives.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Future for JobHandle {
    type Output = JobOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(BrokerError::BrokerUnavailable),
        })
    }
}
