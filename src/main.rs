//! OpsLedger - CI/CD audit events on an append-only ledger.
//!
//! # Usage
//!
//! ```bash
//! # Run against the gateway configured in opsledger.toml
//! cargo run --release
//!
//! # Override the bind address
//! cargo run --release -- --addr 127.0.0.1:9090
//! ```
//!
//! # Environment Variables
//!
//! - `OPSLEDGER_CONFIG`: Path to a TOML config file
//! - `RUST_LOG`: Logging level (default: info)
//! - `RESET_DB`: Set to "true" to wipe local state on startup (for testing)

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::{Arc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use opsledger::api::{self, AppContext};
use opsledger::config::{self, ClientConfig};
use opsledger::ledger::rpc::HttpLedgerConnector;
use opsledger::ledger::{LedgerAuth, LedgerConnector};
use opsledger::reconcile::{MaterializedLog, Reconciler, SharedLog};
use opsledger::storage::ClientStore;
use opsledger::submit::{LedgerWriter, SubmissionQueue};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "opsledger")]
#[command(about = "Ledger client for CI/CD build and deploy audit events")]
#[command(version)]
struct CliArgs {
    /// Override the server bind address (default: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Path to a TOML config file (overrides OPSLEDGER_CONFIG)
    #[arg(long)]
    config: Option<String>,

    /// Wipe all local state (queue, materialized log, watermark) on startup.
    /// WARNING: This is destructive and cannot be undone!
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,
}

/// Check CLI flag first, then the RESET_DB environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

/// Safely remove the local database directory.
fn reset_data_directory(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        info!("Data directory does not exist, nothing to reset");
        return Ok(());
    }
    warn!(path = %path.display(), "RESET_DB detected - wiping all local state");
    std::fs::remove_dir_all(path)
        .with_context(|| format!("Failed to remove data directory {}", path.display()))?;
    Ok(())
}

// ============================================================================
// Task Names
// ============================================================================

enum TaskName {
    HttpServer,
    Writer(usize),
    Reconciler,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::Writer(id) => write!(f, "Writer-{}", id),
            TaskName::Reconciler => write!(f, "Reconciler"),
        }
    }
}

// ============================================================================
// Task Spawning
// ============================================================================

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Spawn the writer workers into the JoinSet.
fn spawn_writers(task_set: &mut JoinSet<Result<TaskName>>, writer: LedgerWriter, workers: usize) {
    for id in 0..workers {
        let worker = writer.clone();
        task_set.spawn(async move {
            worker.run(id).await;
            Ok(TaskName::Writer(id))
        });
    }
}

/// Spawn the reconciler into the JoinSet.
///
/// A reconciler halt (finality violation) ends the task normally: the log is
/// poisoned, the API keeps serving the degraded view, and the rest of the
/// process stays up.
fn spawn_reconciler(task_set: &mut JoinSet<Result<TaskName>>, reconciler: Reconciler) {
    task_set.spawn(async move {
        reconciler.run().await;
        Ok(TaskName::Reconciler)
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Drain remaining tasks so shutdown is orderly.
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("Supervisor: Task {} shut down", task_name),
            Ok(Err(e)) => warn!("Supervisor: Task ended with error during shutdown: {}", e),
            Err(e) => warn!("Supervisor: Task panicked during shutdown: {}", e),
        }
    }

    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    // Load configuration
    let client_config = match &args.config {
        Some(path) => ClientConfig::load_from_file(std::path::Path::new(path))
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => ClientConfig::load(),
    };

    // Reset DB check - BEFORE any storage initialization
    if should_reset_db(args.reset_db) {
        reset_data_directory(&client_config.storage.db_path)?;
    }

    let server_addr = args
        .addr
        .clone()
        .unwrap_or_else(|| client_config.server.addr.clone());
    config::init(client_config);
    let cfg = config::get();

    info!("OpsLedger starting");
    info!(
        gateway = %cfg.ledger.gateway_url,
        authority = %cfg.ledger.authority,
        workers = cfg.writer.workers,
        "Ledger client configuration"
    );

    // Local persistence and submission queue
    let store = ClientStore::open(&cfg.storage.db_path)
        .with_context(|| format!("Failed to open database at {}", cfg.storage.db_path.display()))?;
    let queue = Arc::new(
        SubmissionQueue::open(store.clone(), cfg.writer.max_in_flight)
            .context("Failed to restore submission queue")?,
    );

    // Materialized log, restored from the persisted finalized region
    let finalized = store
        .load_finalized_events()
        .context("Failed to load finalized events")?;
    let finalized_height = store
        .finalized_height()
        .context("Failed to load finality watermark")?;
    info!(
        finalized_events = finalized.len(),
        finalized_height = ?finalized_height,
        "Materialized log restored"
    );
    let log: SharedLog = Arc::new(RwLock::new(MaterializedLog::from_snapshot(
        finalized,
        finalized_height,
    )));

    // Ledger gateway connector
    let connector: Arc<dyn LedgerConnector> = Arc::new(
        HttpLedgerConnector::new(
            &cfg.ledger.gateway_url,
            std::time::Duration::from_secs(cfg.ledger.http_timeout_secs),
        )
        .context("Failed to build ledger gateway client")?,
    );
    let auth = LedgerAuth {
        authority: cfg.ledger.authority.clone(),
        token: cfg.ledger.auth_token.clone(),
    };

    let cancel_token = CancellationToken::new();

    // Writers and reconciler
    let writer = LedgerWriter::new(
        Arc::clone(&queue),
        Arc::clone(&connector),
        auth,
        cfg.writer.settings(),
        cancel_token.clone(),
    );
    let reconciler = Reconciler::new(
        Arc::clone(&connector),
        Arc::clone(&log),
        Arc::clone(&queue),
        store.clone(),
        cfg.reconciler.settings(),
        cancel_token.clone(),
    );

    // HTTP server
    let ctx = AppContext {
        queue: Arc::clone(&queue),
        log: Arc::clone(&log),
        store,
        writer_stats: writer.stats_handle(),
        reconciler_stats: reconciler.stats_handle(),
        started_at: std::time::Instant::now(),
    };
    let app = api::create_app(ctx);
    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("Failed to bind {}", server_addr))?;
    info!(addr = %server_addr, "HTTP server listening");

    // Ctrl+C triggers a coordinated shutdown
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    spawn_http_server(&mut task_set, listener, app, cancel_token.clone());
    spawn_writers(&mut task_set, writer, cfg.writer.workers);
    spawn_reconciler(&mut task_set, reconciler);

    run_supervisor(&mut task_set, cancel_token).await
}
