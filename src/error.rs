use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::FailureReason;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Broker overloaded, {depth} jobs already queued")]
    Overloaded { depth: usize },

    #[error("Computation failed for job {job_id}: {reason}")]
    ComputationFailed { job_id: Uuid, reason: FailureReason },

    #[error("Computation timed out after {timeout_ms}ms (job {job_id})")]
    ComputationTimeout { job_id: Uuid, timeout_ms: u64 },

    #[error("Broker is not running")]
    BrokerUnavailable,

    #[error("Failed to spawn worker {worker_id}: {message}")]
    WorkerSpawn { worker_id: u64, message: String },

    #[error("Worker link error: {0}")]
    WorkerLink(String),

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
