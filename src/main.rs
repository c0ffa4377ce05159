use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use geo_broker::broker::Broker;
use geo_broker::cache::ContentHash;
use geo_broker::caller::Caller;
use geo_broker::catalog::FunctionCatalog;
use geo_broker::config::{BrokerConfig, PoolConfig, WorkerCommandConfig};
use geo_broker::shutdown::install_shutdown_handler;
use geo_broker::worker::{ClientRequest, ProcessSpawner};
use geo_broker::BrokerError;

#[derive(Parser, Debug)]
#[command(name = "geo-broker")]
#[command(version)]
#[command(about = "Job broker dispatching geo computations to a pool of worker processes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the broker and serve requests read from stdin
    Serve(ServeArgs),

    /// List the functions workers can run
    Functions {
        /// Catalog file (JSON array of {name, remote, params})
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Print the content hash of a file
    Hash {
        file: PathBuf,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Program started for every worker
    #[arg(long, default_value = "Rscript")]
    worker_program: String,

    /// Argument passed to the worker program (repeatable)
    #[arg(long = "worker-arg", default_value = "worker.R")]
    worker_args: Vec<String>,

    /// Working directory of the worker processes
    #[arg(long)]
    worker_dir: Option<PathBuf>,

    /// Catalog file replacing the built-in functions
    #[arg(long)]
    catalog: Option<PathBuf>,

    #[arg(long, default_value = "1")]
    min_workers: usize,

    #[arg(long, default_value = "4")]
    max_workers: usize,

    /// Jobs allowed to wait for a worker before requests are rejected
    #[arg(long, default_value = "256")]
    max_queue_depth: usize,

    /// Deadline of one dispatch attempt
    #[arg(long, default_value = "120000")]
    job_timeout_ms: u64,

    /// Caller-side deadline of a whole request
    #[arg(long, default_value = "300000")]
    call_timeout_ms: u64,

    #[arg(long, default_value = "500")]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value = "5000")]
    liveness_timeout_ms: u64,

    /// Treat a running worker process as alive even if it writes no heartbeat lines
    #[arg(long)]
    synthetic_heartbeats: bool,
}

impl ServeArgs {
    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            pool: PoolConfig {
                min_workers: self.min_workers,
                max_workers: self.max_workers,
                heartbeat_interval_ms: self.heartbeat_interval_ms,
                liveness_timeout_ms: self.liveness_timeout_ms,
                ..PoolConfig::default()
            },
            max_queue_depth: self.max_queue_depth,
            job_timeout_ms: self.job_timeout_ms,
            call_timeout_ms: self.call_timeout_ms,
            ..BrokerConfig::default()
        }
    }

    fn worker_command(&self) -> WorkerCommandConfig {
        WorkerCommandConfig {
            program: self.worker_program.clone(),
            args: self.worker_args.clone(),
            current_dir: self.worker_dir.clone(),
            synthetic_heartbeats: self.synthetic_heartbeats,
        }
    }
}

/// One line written to stdout per request.
#[derive(Debug, Serialize)]
struct ServeReply {
    job_id: uuid::Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await,
        Commands::Functions { catalog, output } => list_functions(catalog, output).await,
        Commands::Hash { file } => hash_file(file).await,
    }
}

// =============================================================================
// Serve
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries replies
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.broker_config();
    if !config.pool.is_valid() {
        return Err(format!(
            "invalid pool bounds: min_workers={} max_workers={}",
            config.pool.min_workers, config.pool.max_workers
        )
        .into());
    }

    let catalog = load_catalog(args.catalog.as_deref()).await?;
    let spawner = Arc::new(ProcessSpawner::new(
        args.worker_command(),
        config.pool.heartbeat_interval(),
    ));

    let shutdown = install_shutdown_handler()?;
    let (handle, broker_task) = Broker::start(config.clone(), catalog, spawner, shutdown.clone());
    let caller = Caller::new(handle, config.call_timeout());

    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = out_rx.recv().await {
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                tracing::error!(error = %e, "Failed to write reply");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = JoinSet::new();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!("Input closed, waiting for pending requests");
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let request: ClientRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed request line");
                continue;
            }
        };

        let caller = caller.clone();
        let out_tx = out_tx.clone();
        pending.spawn(async move {
            let job_id = request.job_id;
            let reply = match caller.call_request(request, None).await {
                Ok(bytes) => ServeReply {
                    job_id,
                    result: Some(String::from_utf8_lossy(&bytes).into_owned()),
                    error: None,
                },
                Err(e) => ServeReply {
                    job_id,
                    result: None,
                    error: Some(e.to_string()),
                },
            };
            match serde_json::to_string(&reply) {
                Ok(line) => {
                    let _ = out_tx.send(line).await;
                }
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to encode reply"),
            }
        });
    }

    while let Some(joined) = pending.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Request task panicked");
        }
    }

    drop(caller);
    drop(out_tx);
    broker_task.await?;
    writer.await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn load_catalog(path: Option<&std::path::Path>) -> Result<FunctionCatalog, BrokerError> {
    match path {
        Some(path) => {
            let catalog = FunctionCatalog::load(path).await?;
            tracing::info!(path = %path.display(), functions = catalog.specs().len(), "Function catalog loaded");
            Ok(catalog)
        }
        None => Ok(FunctionCatalog::default()),
    }
}

// =============================================================================
// Functions / Hash
// =============================================================================

async fn list_functions(
    catalog: Option<PathBuf>,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = load_catalog(catalog.as_deref()).await?;
    let specs = catalog.specs();

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&specs)?),
        OutputFormat::Table => {
            println!("{:<12} {:<20} PARAMS", "NAME", "REMOTE");
            println!("{}", "-".repeat(60));
            for spec in specs {
                println!("{:<12} {:<20} {}", spec.name, spec.remote, spec.params.join(", "));
            }
        }
    }
    Ok(())
}

async fn hash_file(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = tokio::fs::read(&file).await?;
    println!("{}  {}", ContentHash::of(&bytes), file.display());
    Ok(())
}
