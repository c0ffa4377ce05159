use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::broker::BrokerHandle;
use crate::cache::Artifact;
use crate::error::{BrokerError, Result};
use crate::identity::ClientId;
use crate::worker::ClientRequest;

/// Blocking-style entry point on top of the broker: submit and wait.
#[derive(Clone)]
pub struct Caller {
    broker: BrokerHandle,
    default_timeout: Duration,
}

impl Caller {
    pub fn new(broker: BrokerHandle, default_timeout: Duration) -> Self {
        Self {
            broker,
            default_timeout,
        }
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `function` on some worker and wait for its raw result bytes.
    ///
    /// On timeout the job handle is dropped: the job may still finish on its
    /// worker, but its reply is discarded.
    pub async fn call(
        &self,
        function: &str,
        args: Value,
        client_id: &ClientId,
        timeout: Option<Duration>,
    ) -> Result<Artifact> {
        let request = ClientRequest {
            client_id: client_id.clone(),
            job_id: Uuid::new_v4(),
            function_name: function.to_string(),
            json_args: args,
        };
        self.call_request(request, timeout).await
    }

    /// Same as [`Caller::call`], driven by a Client → Broker envelope.
    pub async fn call_request(&self, request: ClientRequest, timeout: Option<Duration>) -> Result<Artifact> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let function = request.function_name.clone();
        let handle = self.broker.submit_request(request)?;
        let job_id = handle.job_id();

        match tokio::time::timeout(timeout, handle).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    function = %function,
                    timeout_ms = timeout.as_millis() as u64,
                    "Call timed out, abandoning job"
                );
                Err(BrokerError::ComputationTimeout {
                    job_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}
