//! `dagflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — start the API server (optionally with an embedded worker).
//! - `worker`   — start a task-queue worker.
//! - `migrate`  — run pending database migrations.
//! - `validate` — validate a workflow JSON file.
//! - `cancel`   — request cancellation of a running execution.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use api::{AppState, DEFAULT_ALLOWED_ORIGINS};
use db::{MemoryStore, PgStore, PoolConfig, Store};
use engine::{Dag, DefaultActivities, ExecutorConfig, WorkflowExecutor};
use nodes::{HttpClient, Sandbox};
use queue::{RuntimeClient, Worker, WorkerConfig};

#[derive(Parser)]
#[command(
    name = "dagflow",
    about = "Durable DAG workflow engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DatabaseArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = db::pool::DEFAULT_MAX_CONNECTIONS)]
    max_connections: u32,

    /// Seconds to wait for a free pooled connection.
    #[arg(long, env = "DATABASE_ACQUIRE_TIMEOUT_SECS", default_value_t = 5)]
    acquire_timeout_secs: u64,

    /// Close pooled connections idle for this many seconds.
    #[arg(long, env = "DATABASE_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,
}

#[derive(Args)]
struct WorkerArgs {
    /// Maximum executions run at once by this process.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    #[arg(long, env = "WORKER_POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// How long a claimed task stays owned without a heartbeat.
    #[arg(long, env = "WORKER_LEASE_SECS", default_value_t = 60)]
    lease_secs: u64,

    /// Durable runtime endpoint. The runtime is embedded and backed by the
    /// database, so this is only reported.
    #[arg(long, env = "TEMPORAL_HOST", default_value = "localhost:7233")]
    runtime_host: String,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, env = "API_PORT", default_value_t = 8080)]
        port: u16,

        /// Comma separated list of allowed origins; `*` allows any.
        #[arg(long, env = "CORS_ALLOWED_ORIGINS", default_value = DEFAULT_ALLOWED_ORIGINS)]
        cors_allowed_origins: String,

        /// Keep all state in memory instead of Postgres. Implies
        /// `--with-worker`.
        #[arg(long)]
        in_memory: bool,

        /// Also run executions in this process.
        #[arg(long)]
        with_worker: bool,

        #[command(flatten)]
        db: DatabaseArgs,

        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Start a worker that runs queued executions.
    Worker {
        #[command(flatten)]
        db: DatabaseArgs,

        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[command(flatten)]
        db: DatabaseArgs,
    },
    /// Validate a workflow definition JSON file (`{nodes, edges}`).
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Request cancellation of an execution.
    Cancel {
        execution_id: Uuid,

        #[command(flatten)]
        db: DatabaseArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("ignoring unreadable .env file: {e}");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            cors_allowed_origins,
            in_memory,
            with_worker,
            db,
            worker,
        } => {
            let store: Arc<dyn Store> = if in_memory {
                warn!("using in-memory store; all state is lost on exit");
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(connect(&db).await?)
            };

            let shutdown = shutdown_signal();
            let worker_task = if with_worker || in_memory {
                let worker = build_worker(store.clone(), &worker)?;
                let token = shutdown.clone();
                Some(tokio::spawn(async move { worker.run(token).await }))
            } else {
                None
            };

            let origins = api::parse_origins(&cors_allowed_origins);
            let state = AppState::new(store.clone(), RuntimeClient::new(store));
            let app = api::router(state, &origins);

            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("cannot bind port {port}"))?;
            info!(port, ?origins, "Starting API server");
            api::serve(listener, app, shutdown.clone()).await?;

            shutdown.cancel();
            if let Some(task) = worker_task {
                task.await??;
            }
            info!("Server stopped");
        }
        Command::Worker { db, worker } => {
            let store: Arc<dyn Store> = Arc::new(connect(&db).await?);
            let worker = build_worker(store, &worker)?;
            worker.run(shutdown_signal()).await?;
            info!("Worker stopped");
        }
        Command::Migrate { db } => {
            let store = connect(&db).await?;
            db::pool::run_migrations(store.pool())
                .await
                .context("migration failed")?;
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;
            let value: serde_json::Value =
                serde_json::from_str(&content).context("invalid JSON")?;
            let dag = Dag::from_json(&value).context("not a workflow graph")?;

            let errors = engine::validate(&dag);
            if !errors.is_empty() {
                eprintln!("❌ Validation failed:");
                for e in &errors {
                    eprintln!("  - {e}");
                }
                std::process::exit(1);
            }
            let order = engine::topological_order(&dag)?;
            println!("✅ Workflow is valid. Execution order: {order:?}");
        }
        Command::Cancel { execution_id, db } => {
            let store: Arc<dyn Store> = Arc::new(connect(&db).await?);
            RuntimeClient::new(store).cancel(execution_id).await?;
            println!("Cancellation requested for execution {execution_id}");
        }
    }

    Ok(())
}

async fn connect(args: &DatabaseArgs) -> anyhow::Result<PgStore> {
    let url = args
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set (or pass --database-url)")?;
    let pool = PoolConfig::new(url)
        .with_max_connections(args.max_connections)
        .with_acquire_timeout(Duration::from_secs(args.acquire_timeout_secs))
        .with_idle_timeout(args.idle_timeout_secs.map(Duration::from_secs))
        .connect()
        .await
        .context("failed to connect to database")?;
    Ok(PgStore::new(pool))
}

fn build_worker(store: Arc<dyn Store>, args: &WorkerArgs) -> anyhow::Result<Worker> {
    info!(runtime_host = %args.runtime_host, "using embedded durable runtime");
    let activities = DefaultActivities::new(store.clone(), HttpClient::new()?, Sandbox::new());
    let executor = WorkflowExecutor::new(store.clone(), Arc::new(activities), ExecutorConfig::default());
    let config = WorkerConfig {
        concurrency: args.concurrency.max(1),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        lease_duration: Duration::from_secs(args.lease_secs),
        ..WorkerConfig::default()
    };
    Ok(Worker::new(store, Arc::new(executor), config))
}

/// A token cancelled on Ctrl-C.
fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let fire = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                fire.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
    token
}
