use std::path::PathBuf;
use std::time::Duration;

/// Bounds and timing of the auto-scaled worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept alive even when idle
    pub min_workers: usize,
    /// Hard ceiling on Starting + Idle + Busy workers
    pub max_workers: usize,
    /// Interval of the heartbeat sweep
    pub heartbeat_interval_ms: u64,
    /// A Busy worker silent for longer than this is presumed dead
    pub liveness_timeout_ms: u64,
    /// Interval of the auto-scale tick
    pub scale_interval_ms: u64,
    /// Minimum delay between two scale actions
    pub scale_cooldown_ms: u64,
    /// Idle count above which a tick counts towards shrinking
    pub idle_high_water: usize,
    /// Consecutive high-water ticks before the longest-idle worker is retired
    pub idle_ticks_before_shrink: u32,
    /// A worker that has not reported ready after this long is discarded
    pub startup_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            heartbeat_interval_ms: 500,
            liveness_timeout_ms: 5_000,
            scale_interval_ms: 1_000,
            scale_cooldown_ms: 5_000,
            idle_high_water: 1,
            idle_ticks_before_shrink: 10,
            startup_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_millis(self.scale_interval_ms)
    }

    pub fn scale_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_cooldown_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Check the bounds are usable: `min <= max` and at least one worker allowed.
    pub fn is_valid(&self) -> bool {
        self.max_workers > 0 && self.min_workers <= self.max_workers
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub pool: PoolConfig,
    /// Jobs allowed to wait for a worker before submissions are rejected
    pub max_queue_depth: usize,
    /// Deadline of a single dispatch attempt
    pub job_timeout_ms: u64,
    /// Default caller-side timeout used by `Caller::call`
    pub call_timeout_ms: u64,
    /// Capacity of the submission channel into the broker loop
    pub submit_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            max_queue_depth: 256,
            job_timeout_ms: 120_000,
            call_timeout_ms: 300_000,
            submit_buffer: 1024,
        }
    }
}

impl BrokerConfig {
    pub fn with_pool_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.pool.min_workers = min_workers;
        self.pool.max_workers = max_workers;
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Client registry lifecycle settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of remembered client identifiers
    pub capacity: usize,
    /// Entries not seen for this long are evicted
    pub idle_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            idle_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl RegistryConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// How to launch one external worker process.
///
/// Every worker is started as `program args...` with `GEO_BROKER_WORKER_ID`
/// set in its environment and speaks line-delimited JSON on stdin/stdout.
/// Liveness comes from the `heartbeat` signal lines the worker writes.
#[derive(Debug, Clone)]
pub struct WorkerCommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the worker process
    pub current_dir: Option<PathBuf>,
    /// Emit heartbeats on the worker's behalf for as long as the child
    /// process runs. For worker programs that cannot write heartbeat lines;
    /// a wedged child then stays alive until the job deadline.
    pub synthetic_heartbeats: bool,
}

impl Default for WorkerCommandConfig {
    fn default() -> Self {
        Self {
            program: "Rscript".to_string(),
            args: vec!["worker.R".to_string()],
            current_dir: None,
            synthetic_heartbeats: false,
        }
    }
}

impl WorkerCommandConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            synthetic_heartbeats: false,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_synthetic_heartbeats(mut self) -> Self {
        self.synthetic_heartbeats = true;
        self
    }
}
