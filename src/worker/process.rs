use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerCommandConfig;
use crate::error::{BrokerError, Result};
use crate::scheduler::WorkerId;
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::protocol::{WorkerCall, WorkerEvent, WorkerMessage};
use crate::worker::proxy::{WorkerProxy, WorkerSpawner};

pub const WORKER_ID_ENV: &str = "GEO_BROKER_WORKER_ID";

const EVENT_BUFFER: usize = 64;

/// A worker running as a child process.
///
/// Calls are written to the child's stdin as JSON lines; replies, readiness
/// and heartbeat signals are read from its stdout. A child that stops writing
/// heartbeats mid-job is caught by the broker's liveness sweep. With
/// `synthetic_heartbeats` the worker is instead reported alive for as long as
/// the process runs.
pub struct ProcessWorker {
    worker_id: WorkerId,
    stdin: Mutex<ChildStdin>,
    events_rx: Mutex<mpsc::Receiver<WorkerEvent>>,
    cancel: CancellationToken,
}

impl ProcessWorker {
    pub fn spawn(
        worker_id: WorkerId,
        config: &WorkerCommandConfig,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        tracing::info!(worker_id, program = %config.program, args = ?config.args, "Spawning worker process");

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .env(WORKER_ID_ENV, worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| BrokerError::WorkerSpawn {
            worker_id,
            message: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe(worker_id, "stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(worker_id, "stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe(worker_id, "stderr"))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));

        // Supervisor: owns the child, kills it on close
        let supervisor_cancel = cancel.clone();
        let supervisor_alive = alive.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::warn!(worker_id, status = %status, "Worker process exited"),
                        Err(e) => tracing::error!(worker_id, error = %e, "Failed to wait on worker process"),
                    }
                }
                _ = supervisor_cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(worker_id, error = %e, "Failed to kill worker process");
                    }
                }
            }
            supervisor_alive.store(false, Ordering::SeqCst);
        });

        // Stdout reader: one JSON message per line
        let reader_tx = events_tx.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    read = stdout.read_until(b'\n', &mut line) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let Some(event) = parse_line(worker_id, &line) else {
                            continue;
                        };
                        if reader_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "Failed to read worker output");
                        break;
                    }
                }
            }
            // The reader going away means the worker is gone; stop heartbeats too
            reader_cancel.cancel();
        });

        // Stderr is diagnostics only
        tokio::spawn(async move {
            let mut stderr = BufReader::new(stderr);
            let mut line = Vec::new();
            while let Ok(n) = stderr.read_until(b'\n', &mut line).await {
                if n == 0 {
                    break;
                }
                tracing::debug!(worker_id, line = %String::from_utf8_lossy(line.trim_ascii()), "Worker stderr");
                line.clear();
            }
        });

        if config.synthetic_heartbeats {
            let heartbeat = HeartbeatSender::new(heartbeat_interval);
            let heartbeat_cancel = cancel.clone();
            tokio::spawn(async move {
                heartbeat
                    .run(events_tx, heartbeat_cancel, move || alive.load(Ordering::SeqCst))
                    .await;
            });
        }

        Ok(Self {
            worker_id,
            stdin: Mutex::new(stdin),
            events_rx: Mutex::new(events_rx),
            cancel,
        })
    }
}

/// Decode one stdout line. Blank, malformed and foreign lines are skipped.
fn parse_line(worker_id: WorkerId, line: &[u8]) -> Option<WorkerEvent> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice::<WorkerMessage>(line) {
        Ok(message) if message.worker_id() != worker_id => {
            tracing::warn!(
                worker_id,
                claimed = message.worker_id(),
                "Ignoring message with mismatched worker id"
            );
            None
        }
        Ok(message) => Some(WorkerEvent::from(message)),
        Err(e) => {
            tracing::warn!(worker_id, error = %e, bytes = line.len(), "Skipping unparseable line from worker");
            None
        }
    }
}

fn missing_pipe(worker_id: WorkerId, pipe: &str) -> BrokerError {
    BrokerError::WorkerSpawn {
        worker_id,
        message: format!("{} pipe unavailable", pipe),
    }
}

#[async_trait]
impl WorkerProxy for ProcessWorker {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    async fn send(&self, call: &WorkerCall) -> Result<()> {
        let mut line = serde_json::to_vec(call)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<WorkerEvent>> {
        Ok(self.events_rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Starts every worker from the same command line.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    config: WorkerCommandConfig,
    heartbeat_interval: Duration,
}

impl ProcessSpawner {
    pub fn new(config: WorkerCommandConfig, heartbeat_interval: Duration) -> Self {
        Self {
            config,
            heartbeat_interval,
        }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, worker_id: WorkerId) -> Result<Arc<dyn WorkerProxy>> {
        let worker = ProcessWorker::spawn(worker_id, &self.config, self.heartbeat_interval)?;
        Ok(Arc::new(worker))
    }
}
