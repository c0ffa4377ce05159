use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::identity::ClientId;
use crate::scheduler::WorkerId;

pub type JobId = Uuid;

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The second dispatch attempt exceeded the job deadline
    Timeout,
    /// The worker reported an error, or vanished while holding the job
    WorkerError(String),
    /// The job had already used its retry and could not be delivered again
    RetryExhausted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::WorkerError(msg) => write!(f, "worker error: {}", msg),
            FailureReason::RetryExhausted => write!(f, "retry exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Dispatched,
    Completed,
    Failed(FailureReason),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed(_))
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Dispatched => write!(f, "dispatched"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Structured form of a remote invocation.
///
/// Only [`CallRecord::call_template`] produces the textual call expression
/// workers expect; everything else in the broker works on the record.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Public function name as submitted by clients
    pub function: String,
    /// Name of the function on the worker side
    pub remote_function: String,
    pub param_names: Vec<String>,
    pub args: Map<String, Value>,
}

impl CallRecord {
    /// Render `remote(p1=p1, p2=p2, ...)`.
    ///
    /// Parameter names are echoed as both keyword and placeholder; workers
    /// substitute real values from `json_args` by name.
    pub fn call_template(&self) -> String {
        let params = self
            .param_names
            .iter()
            .map(|name| format!("{}={}", name, name))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.remote_function, params)
    }

    pub fn json_args(&self) -> Value {
        Value::Object(self.args.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub call: CallRecord,
    pub client_id: ClientId,
    pub submitted_at: DateTime<Utc>,
    pub state: JobState,
    /// 0 on first attempt, 1 once the job has been retried
    pub retry_count: u8,
    pub assigned_worker: Option<WorkerId>,
    pub dispatched_at: Option<Instant>,
}

impl Job {
    pub fn new(call: CallRecord, client_id: ClientId) -> Self {
        Self::with_id(Uuid::new_v4(), call, client_id)
    }

    pub fn with_id(id: JobId, call: CallRecord, client_id: ClientId) -> Self {
        Self {
            id,
            call,
            client_id,
            submitted_at: Utc::now(),
            state: JobState::Queued,
            retry_count: 0,
            assigned_worker: None,
            dispatched_at: None,
        }
    }

    pub fn mark_dispatched(&mut self, worker_id: WorkerId) {
        self.state = JobState::Dispatched;
        self.assigned_worker = Some(worker_id);
        self.dispatched_at = Some(Instant::now());
    }

    /// Put the job back in `Queued` after its worker was lost.
    ///
    /// Returns false when the retry was already used; the caller must then fail the job.
    pub fn requeue_for_retry(&mut self) -> bool {
        if self.retry_count >= 1 {
            return false;
        }
        self.retry_count += 1;
        self.reset_to_queued();
        true
    }

    /// Back to `Queued` without consuming the retry (the worker never got the job).
    pub fn reset_to_queued(&mut self) {
        self.state = JobState::Queued;
        self.assigned_worker = None;
        self.dispatched_at = None;
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count == 0
    }
}
