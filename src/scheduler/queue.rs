use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::scheduler::job::{Job, JobId, JobState};
use crate::scheduler::pool::WorkerId;

const DEFAULT_MAX_DEPTH: usize = 256;

/// FIFO of waiting jobs plus the table of every live job.
///
/// A job stays in the table from submission until it reaches a terminal
/// state; only `Queued` jobs are in the pending order.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<JobId, Job>,
    pending: VecDeque<JobId>,
    max_depth: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_DEPTH)
    }

    pub fn with_capacity(max_depth: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            max_depth,
        }
    }

    /// Append a new job at the tail. Returns the job back if the queue is full.
    pub fn enqueue(&mut self, job: Job) -> Result<(), Job> {
        if self.is_full() || self.jobs.contains_key(&job.id) {
            return Err(job);
        }
        self.pending.push_back(job.id);
        self.jobs.insert(job.id, job);
        Ok(())
    }

    /// Put an existing job back at the head so it is dispatched next.
    ///
    /// Retried jobs bypass the depth bound: they were already admitted.
    pub fn push_front(&mut self, job_id: JobId) -> bool {
        match self.jobs.get(&job_id) {
            Some(job) if job.state == JobState::Queued => {
                self.pending.push_front(job_id);
                true
            }
            _ => false,
        }
    }

    /// Pop the oldest queued job id.
    pub fn pop_next(&mut self) -> Option<JobId> {
        self.pending.pop_front()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn get_job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_job_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Remove a job from the table, fixing its terminal state.
    pub fn finish(&mut self, id: &JobId, state: JobState) -> Option<Job> {
        self.pending.retain(|pending| pending != id);
        let mut job = self.jobs.remove(id)?;
        job.state = state;
        Some(job)
    }

    /// Dispatched jobs whose current attempt has run longer than `timeout`.
    pub fn overdue(&self, timeout: Duration) -> Vec<(JobId, WorkerId)> {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Dispatched)
            .filter(|j| j.dispatched_at.is_some_and(|at| at.elapsed() >= timeout))
            .filter_map(|j| j.assigned_worker.map(|worker_id| (j.id, worker_id)))
            .collect()
    }

    /// Drop every job, returning them in submission order.
    pub fn drain(&mut self) -> Vec<Job> {
        self.pending.clear();
        let mut jobs: Vec<Job> = self.jobs.drain().map(|(_, job)| job).collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Jobs waiting for a worker
    pub fn depth(&self) -> usize {
        self.pending.len()
    }

    /// Jobs currently held by a worker
    pub fn in_flight(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Dispatched)
            .count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_depth
    }
}
