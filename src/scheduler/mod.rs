//! Broker-side bookkeeping: jobs, the pending queue, the worker pool and the
//! auto-scale rule. Everything here is plain data mutated by the broker loop.

pub mod job;
pub mod pool;
pub mod queue;
pub mod scale;

pub use job::{CallRecord, FailureReason, Job, JobId, JobState};
pub use pool::{PoolSnapshot, WorkerId, WorkerPool, WorkerState, WorkerStatus};
pub use queue::JobQueue;
pub use scale::{ScaleDecision, ScalePolicy};
