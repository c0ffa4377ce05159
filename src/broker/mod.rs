//! The job broker.
//!
//! A single task owns the queue, the worker pool and the table of waiting
//! callers. Everything else talks to it through channels:
//! - [`BrokerHandle`] submits jobs and asks for stats over a bounded channel
//! - [`WorkerLink`] tasks report worker events over an internal channel
//! - spawn tasks report freshly started (or failed) workers the same way
//!
//! Two interval ticks drive the rest: the heartbeat sweep (liveness and job
//! deadlines) and the auto-scale rule.

pub mod handle;
pub mod link;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::Artifact;
use crate::catalog::FunctionCatalog;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::scheduler::{
    FailureReason, Job, JobId, JobQueue, JobState, ScaleDecision, ScalePolicy, WorkerId, WorkerPool,
};
use crate::worker::{WorkerCall, WorkerEvent, WorkerSpawner};

pub use handle::{BrokerHandle, BrokerMessage, BrokerStats, JobHandle, JobOutcome};
pub use link::{LinkEvent, WorkerLink};

const EVENT_BUFFER: usize = 256;

/// Why a worker is being taken out of the pool while holding a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LossCause {
    /// No heartbeat within the liveness timeout
    Silent,
    /// The link reported the worker gone
    Closed,
    /// The job ran past its deadline
    Deadline,
}

impl LossCause {
    fn failure(self) -> FailureReason {
        match self {
            LossCause::Silent => FailureReason::WorkerError("heartbeat lost".to_string()),
            LossCause::Closed => FailureReason::WorkerError("worker link closed".to_string()),
            LossCause::Deadline => FailureReason::Timeout,
        }
    }
}

pub struct Broker {
    config: BrokerConfig,
    queue: JobQueue,
    pool: WorkerPool,
    policy: ScalePolicy,
    links: HashMap<WorkerId, WorkerLink>,
    waiters: HashMap<JobId, oneshot::Sender<JobOutcome>>,
    spawner: Arc<dyn WorkerSpawner>,
    requests_rx: mpsc::Receiver<BrokerMessage>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        catalog: FunctionCatalog,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> (Self, BrokerHandle) {
        let (requests_tx, requests_rx) = mpsc::channel(config.submit_buffer.max(1));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let broker = Self {
            queue: JobQueue::with_capacity(config.max_queue_depth),
            pool: WorkerPool::new(&config.pool),
            policy: ScalePolicy::new(&config.pool),
            links: HashMap::new(),
            waiters: HashMap::new(),
            spawner,
            requests_rx,
            events_tx,
            events_rx,
            config,
        };
        let handle = BrokerHandle::new(requests_tx, Arc::new(catalog));
        (broker, handle)
    }

    /// Build a broker and run it on its own task until `shutdown` fires.
    pub fn start(
        config: BrokerConfig,
        catalog: FunctionCatalog,
        spawner: Arc<dyn WorkerSpawner>,
        shutdown: CancellationToken,
    ) -> (BrokerHandle, JoinHandle<()>) {
        let (broker, handle) = Self::new(config, catalog, spawner);
        let task = tokio::spawn(broker.run(shutdown));
        (handle, task)
    }

    /// Main loop.
    ///
    /// Exits on `shutdown`, or once every handle is dropped and no job is
    /// left in the queue.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            min_workers = self.pool.min_workers(),
            max_workers = self.pool.max_workers(),
            max_queue_depth = self.config.max_queue_depth,
            "Broker started"
        );
        self.replenish();

        let mut sweep = tokio::time::interval(self.config.pool.heartbeat_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut scale = tokio::time::interval(self.config.pool.scale_interval());
        scale.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut accepting = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Broker shutdown requested");
                    break;
                }

                msg = self.requests_rx.recv(), if accepting => {
                    match msg {
                        Some(msg) => self.on_request(msg),
                        None => {
                            tracing::info!(pending = self.queue.len(), "All broker handles dropped, draining");
                            accepting = false;
                        }
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.on_link_event(event);
                }

                _ = sweep.tick() => {
                    self.sweep();
                }

                _ = scale.tick() => {
                    self.autoscale();
                }
            }

            self.dispatch();

            if !accepting && self.queue.is_empty() {
                break;
            }
        }

        self.shutdown_all();
    }

    fn on_request(&mut self, msg: BrokerMessage) {
        match msg {
            BrokerMessage::Submit { job, response_tx } => self.enqueue(job, response_tx),
            BrokerMessage::Stats { response_tx } => {
                let _ = response_tx.send(self.stats());
            }
        }
    }

    fn enqueue(&mut self, job: Job, response_tx: oneshot::Sender<JobOutcome>) {
        let job_id = job.id;
        if self.queue.contains(&job_id) {
            tracing::warn!(job_id = %job_id, "Duplicate job id rejected");
            let _ = response_tx.send(Err(BrokerError::InvalidInput(format!(
                "job {} is already in flight",
                job_id
            ))));
            return;
        }

        match self.queue.enqueue(job) {
            Ok(()) => {
                self.waiters.insert(job_id, response_tx);
                tracing::debug!(job_id = %job_id, depth = self.queue.depth(), "Job queued");
            }
            Err(_) => {
                let depth = self.queue.depth();
                tracing::warn!(job_id = %job_id, depth, "Job queue at capacity, job rejected");
                let _ = response_tx.send(Err(BrokerError::Overloaded { depth }));
            }
        }
    }

    /// Pair queued jobs with idle workers until one side runs out.
    fn dispatch(&mut self) {
        while self.pool.idle_count() > 0 {
            let Some(job_id) = self.queue.pop_next() else {
                break;
            };

            if self.waiters.get(&job_id).map_or(true, |tx| tx.is_closed()) {
                tracing::debug!(job_id = %job_id, "Caller gone, dropping queued job");
                self.waiters.remove(&job_id);
                self.queue
                    .finish(&job_id, JobState::Failed(FailureReason::Timeout));
                continue;
            }

            let Some(worker_id) = self.pool.checkout(job_id) else {
                self.queue.push_front(job_id);
                break;
            };

            let Some(job) = self.queue.get_job_mut(&job_id) else {
                self.pool.release(worker_id, &job_id);
                continue;
            };
            job.mark_dispatched(worker_id);
            let retry_count = job.retry_count;
            let call = WorkerCall::for_job(worker_id, job);

            let sent = self
                .links
                .get(&worker_id)
                .map(|link| link.try_send(call))
                .unwrap_or(false);
            if sent {
                tracing::info!(job_id = %job_id, worker_id, retry_count, "Job dispatched");
                continue;
            }

            // The worker never received the job
            tracing::warn!(job_id = %job_id, worker_id, "Dispatch failed, removing worker");
            self.retire(worker_id);
            if retry_count == 0 {
                if let Some(job) = self.queue.get_job_mut(&job_id) {
                    job.reset_to_queued();
                }
                self.queue.push_front(job_id);
            } else {
                self.fail_job(job_id, FailureReason::RetryExhausted);
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Started { worker_id, proxy } => {
                if self.pool.contains(worker_id) && !self.links.contains_key(&worker_id) {
                    tracing::debug!(worker_id, "Worker link opened");
                    let link = WorkerLink::open(proxy, self.events_tx.clone());
                    self.links.insert(worker_id, link);
                } else {
                    tracing::debug!(worker_id, "Discarding worker started after removal");
                    tokio::spawn(async move {
                        let _ = proxy.close().await;
                    });
                }
            }
            LinkEvent::SpawnFailed { worker_id, error } => {
                tracing::error!(worker_id, error = %error, "Worker failed to start");
                self.pool.remove(worker_id);
            }
            LinkEvent::Event { worker_id, event } => {
                if !self.pool.contains(worker_id) {
                    tracing::debug!(worker_id, "Ignoring event from removed worker");
                    return;
                }
                match event {
                    WorkerEvent::Ready => {
                        self.pool.mark_ready(worker_id);
                    }
                    WorkerEvent::Heartbeat => self.pool.heartbeat(worker_id),
                    WorkerEvent::Reply { job_id, outcome } => self.on_reply(worker_id, job_id, outcome),
                }
            }
            LinkEvent::Closed { worker_id } => {
                if self.pool.contains(worker_id) {
                    self.lose_worker(worker_id, LossCause::Closed);
                    self.replenish();
                }
            }
        }
    }

    fn on_reply(&mut self, worker_id: WorkerId, job_id: JobId, outcome: Result<Artifact, String>) {
        if !self.pool.owns(worker_id, &job_id) {
            tracing::warn!(worker_id, job_id = %job_id, "Ignoring stale or duplicate reply");
            return;
        }
        self.pool.heartbeat(worker_id);
        self.pool.release(worker_id, &job_id);

        match outcome {
            Ok(artifact) => self.complete_job(job_id, artifact),
            Err(marker) => {
                tracing::warn!(worker_id, job_id = %job_id, error = %marker, "Worker reported an error");
                self.fail_job(job_id, FailureReason::WorkerError(marker));
            }
        }
    }

    fn complete_job(&mut self, job_id: JobId, artifact: Artifact) {
        self.queue.finish(&job_id, JobState::Completed);
        let bytes = artifact.len();
        match self.waiters.remove(&job_id) {
            Some(tx) => {
                if tx.send(Ok(artifact)).is_err() {
                    tracing::debug!(job_id = %job_id, "Caller gone, reply discarded");
                } else {
                    tracing::info!(job_id = %job_id, bytes, "Job completed");
                }
            }
            None => tracing::debug!(job_id = %job_id, "No caller waiting for reply"),
        }
    }

    fn fail_job(&mut self, job_id: JobId, reason: FailureReason) {
        self.queue
            .finish(&job_id, JobState::Failed(reason.clone()));
        tracing::warn!(job_id = %job_id, reason = %reason, "Job failed");
        if let Some(tx) = self.waiters.remove(&job_id) {
            let _ = tx.send(Err(BrokerError::ComputationFailed { job_id, reason }));
        }
    }

    /// Remove a worker that may be holding a job and retry or fail that job.
    fn lose_worker(&mut self, worker_id: WorkerId, cause: LossCause) {
        let Some((_, held)) = self.pool.remove(worker_id) else {
            return;
        };
        if let Some(link) = self.links.remove(&worker_id) {
            link.close();
        }
        tracing::warn!(worker_id, cause = ?cause, job_id = ?held, "Worker marked dead");

        let Some(job_id) = held else {
            return;
        };
        let Some(job) = self.queue.get_job_mut(&job_id) else {
            return;
        };
        if job.requeue_for_retry() {
            tracing::info!(job_id = %job_id, worker_id, "Job requeued for retry");
            self.queue.push_front(job_id);
        } else {
            self.fail_job(job_id, cause.failure());
        }
    }

    /// Remove a worker that holds no job.
    fn retire(&mut self, worker_id: WorkerId) {
        self.pool.remove(worker_id);
        if let Some(link) = self.links.remove(&worker_id) {
            link.close();
        }
        tracing::info!(worker_id, "Worker retired");
    }

    fn sweep(&mut self) {
        for (worker_id, _) in self.pool.silent_busy_workers() {
            self.lose_worker(worker_id, LossCause::Silent);
        }

        for (job_id, worker_id) in self.queue.overdue(self.config.job_timeout()) {
            if self.pool.owns(worker_id, &job_id) {
                self.lose_worker(worker_id, LossCause::Deadline);
            }
        }

        for worker_id in self.pool.stalled_starting(self.config.pool.startup_timeout()) {
            tracing::warn!(worker_id, "Worker never became ready");
            self.retire(worker_id);
        }

        self.replenish();
    }

    fn autoscale(&mut self) {
        let decision = self
            .policy
            .decide(self.queue.depth(), self.pool.snapshot(), Instant::now());
        match decision {
            ScaleDecision::Grow => {
                tracing::info!(depth = self.queue.depth(), size = self.pool.size(), "Scaling up");
                self.spawn_worker();
            }
            ScaleDecision::Shrink => {
                if let Some(worker_id) = self.pool.longest_idle() {
                    tracing::info!(worker_id, size = self.pool.size(), "Scaling down");
                    self.retire(worker_id);
                }
            }
            ScaleDecision::Hold => {}
        }
        self.replenish();
    }

    /// Spawn workers until the pool is back at `min_workers`.
    fn replenish(&mut self) {
        for _ in 0..self.pool.deficit() {
            if !self.spawn_worker() {
                break;
            }
        }
    }

    /// Reserve a worker id and start the worker on a separate task.
    fn spawn_worker(&mut self) -> bool {
        let Some(worker_id) = self.pool.reserve() else {
            return false;
        };
        let spawner = self.spawner.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match spawner.spawn(worker_id).await {
                Ok(proxy) => LinkEvent::Started { worker_id, proxy },
                Err(error) => LinkEvent::SpawnFailed { worker_id, error },
            };
            if let Err(unsent) = events.send(event).await {
                if let LinkEvent::Started { proxy, .. } = unsent.0 {
                    let _ = proxy.close().await;
                }
            }
        });
        true
    }

    fn stats(&self) -> BrokerStats {
        let snapshot = self.pool.snapshot();
        BrokerStats {
            queue_depth: self.queue.depth(),
            in_flight: self.queue.in_flight(),
            starting: snapshot.starting,
            idle: snapshot.idle,
            busy: snapshot.busy,
            pool_size: snapshot.size(),
            min_workers: self.pool.min_workers(),
            max_workers: self.pool.max_workers(),
        }
    }

    fn shutdown_all(&mut self) {
        for (worker_id, link) in self.links.drain() {
            tracing::debug!(worker_id, "Closing worker link");
            link.close();
        }

        self.requests_rx.close();
        while let Ok(msg) = self.requests_rx.try_recv() {
            if let BrokerMessage::Submit { response_tx, .. } = msg {
                let _ = response_tx.send(Err(BrokerError::BrokerUnavailable));
            }
        }

        let abandoned = self.queue.drain();
        for job in &abandoned {
            if let Some(tx) = self.waiters.remove(&job.id) {
                let _ = tx.send(Err(BrokerError::BrokerUnavailable));
            }
        }
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(BrokerError::BrokerUnavailable));
        }

        tracing::info!(abandoned = abandoned.len(), "Broker stopped");
    }
}
