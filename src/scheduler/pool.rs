use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::scheduler::job::JobId;

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy(JobId),
    Dead,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy(_) => write!(f, "busy"),
            WorkerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Worker state tracking
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub last_heartbeat: Instant,
    pub idle_since: Option<Instant>,
    pub started_at: Instant,
}

impl WorkerState {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            status: WorkerStatus::Starting,
            last_heartbeat: Instant::now(),
            idle_since: None,
            started_at: Instant::now(),
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() < timeout
    }

    pub fn current_job(&self) -> Option<JobId> {
        match self.status {
            WorkerStatus::Busy(job_id) => Some(job_id),
            _ => None,
        }
    }
}

/// Counts of the pool by worker status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
}

impl PoolSnapshot {
    pub fn size(&self) -> usize {
        self.starting + self.idle + self.busy
    }
}

/// Owned collection of live workers with LRU idle ordering.
///
/// Dead workers are removed from the collection immediately; their ids come
/// from a monotonic counter and are never handed out again.
#[derive(Debug)]
pub struct WorkerPool {
    workers: HashMap<WorkerId, WorkerState>,
    /// Idle workers, longest-idle at the front
    idle: VecDeque<WorkerId>,
    next_id: WorkerId,
    min_workers: usize,
    max_workers: usize,
    liveness_timeout: Duration,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            workers: HashMap::new(),
            idle: VecDeque::new(),
            next_id: 1,
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            liveness_timeout: config.liveness_timeout(),
        }
    }

    /// Reserve a new worker slot in `Starting` state.
    /// Returns `None` when the pool is already at `max_workers`.
    pub fn reserve(&mut self) -> Option<WorkerId> {
        if self.size() >= self.max_workers {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.workers.insert(id, WorkerState::new(id));
        tracing::debug!(worker_id = id, "Worker slot reserved");
        Some(id)
    }

    /// `Starting` → `Idle`, at the tail of the LRU list.
    pub fn mark_ready(&mut self, worker_id: WorkerId) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(worker) if worker.status == WorkerStatus::Starting => {
                worker.status = WorkerStatus::Idle;
                worker.idle_since = Some(Instant::now());
                worker.update_heartbeat();
                self.idle.push_back(worker_id);
                tracing::info!(worker_id, "Worker ready");
                true
            }
            _ => false,
        }
    }

    /// Update worker heartbeat
    pub fn heartbeat(&mut self, worker_id: WorkerId) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.update_heartbeat();
        }
    }

    /// Pop the longest-idle worker and make it own `job_id`.
    pub fn checkout(&mut self, job_id: JobId) -> Option<WorkerId> {
        while let Some(worker_id) = self.idle.pop_front() {
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                if worker.status == WorkerStatus::Idle {
                    worker.status = WorkerStatus::Busy(job_id);
                    worker.idle_since = None;
                    // Liveness of a busy worker counts from dispatch
                    worker.update_heartbeat();
                    return Some(worker_id);
                }
            }
        }
        None
    }

    pub fn owns(&self, worker_id: WorkerId, job_id: &JobId) -> bool {
        self.workers
            .get(&worker_id)
            .map(|w| w.status == WorkerStatus::Busy(*job_id))
            .unwrap_or(false)
    }

    /// `Busy(job_id)` → `Idle`, appended to the tail of the LRU list.
    /// Returns false if the worker does not currently own `job_id`.
    pub fn release(&mut self, worker_id: WorkerId, job_id: &JobId) -> bool {
        if !self.owns(worker_id, job_id) {
            return false;
        }
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.status = WorkerStatus::Idle;
            worker.idle_since = Some(Instant::now());
            self.idle.push_back(worker_id);
        }
        true
    }

    /// Remove a worker for good.
    ///
    /// Returns its final state, marked `Dead`, together with the job it held
    /// when removed.
    pub fn remove(&mut self, worker_id: WorkerId) -> Option<(WorkerState, Option<JobId>)> {
        let mut worker = self.workers.remove(&worker_id)?;
        self.idle.retain(|id| *id != worker_id);
        let held = worker.current_job();
        worker.status = WorkerStatus::Dead;
        Some((worker, held))
    }

    pub fn longest_idle(&self) -> Option<WorkerId> {
        self.idle.front().copied()
    }

    /// Busy workers whose heartbeat is older than the liveness timeout.
    pub fn silent_busy_workers(&self) -> Vec<(WorkerId, JobId)> {
        self.workers
            .values()
            .filter(|w| !w.is_alive(self.liveness_timeout))
            .filter_map(|w| w.current_job().map(|job_id| (w.id, job_id)))
            .collect()
    }

    /// Workers still `Starting` after `timeout`.
    pub fn stalled_starting(&self, timeout: Duration) -> Vec<WorkerId> {
        let mut stalled: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Starting && w.started_at.elapsed() >= timeout)
            .map(|w| w.id)
            .collect();
        stalled.sort_unstable();
        stalled
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<&WorkerState> {
        self.workers.get(&worker_id)
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.workers.contains_key(&worker_id)
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Workers missing to reach `min_workers`.
    pub fn deficit(&self) -> usize {
        self.min_workers.saturating_sub(self.size())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut snapshot = PoolSnapshot::default();
        for worker in self.workers.values() {
            match worker.status {
                WorkerStatus::Starting => snapshot.starting += 1,
                WorkerStatus::Idle => snapshot.idle += 1,
                WorkerStatus::Busy(_) => snapshot.busy += 1,
                WorkerStatus::Dead => {}
            }
        }
        snapshot
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}
