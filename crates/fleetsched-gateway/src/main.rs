use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetsched_core::FleetConfig;
use fleetsched_mdm::HttpDeviceManagement;
use fleetsched_scheduler::{EngineSettings, ExecutionEngine, SqliteJobStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod app;
mod http;
mod ticker;

/// Scheduled configuration-profile pushes for a managed device fleet.
#[derive(Parser, Debug)]
#[command(name = "fleetsched", version)]
struct Cli {
    /// Config file (defaults to $FLEETSCHED_CONFIG, then ~/.fleetsched/fleetsched.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the trigger endpoint (and the periodic trigger, if configured)
    Serve,
    /// Execute due schedules once and print the report
    RunOnce,
    /// List all schedules as JSON
    Jobs,
    /// Release a job left claimed by a failed commit and roll it to its next start
    Release { job_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fleetsched_gateway=info,fleetsched_scheduler=info,fleetsched_mdm=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > FLEETSCHED_CONFIG env > ~/.fleetsched/fleetsched.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("FLEETSCHED_CONFIG").ok());
    let config = FleetConfig::load(config_path.as_deref()).context("loading config")?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");
    let store = SqliteJobStore::open(db_path).context("opening job store")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, store).await,
        Command::RunOnce => {
            let engine = build_engine(&config, store)?;
            let report = engine.run_once(chrono::Utc::now()).await?;
            let response = http::execute::TriggerResponse::from(report);
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Command::Jobs => {
            let jobs = store.list_jobs()?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
        Command::Release { job_id } => {
            let due_window = EngineSettings::from_config(&config.engine).due_window;
            let job = store.release_claim(&job_id, chrono::Utc::now(), due_window)?;
            println!("released {} (next start {})", job.id, job.start_time);
            Ok(())
        }
    }
}

/// Validate the config and wire the engine to SQLite and the remote API.
fn build_engine(config: &FleetConfig, store: SqliteJobStore) -> anyhow::Result<ExecutionEngine> {
    config.validate().context("invalid config")?;
    let api = HttpDeviceManagement::from_config(&config.mdm)?;
    let engine = ExecutionEngine::from_config(config, Arc::new(store), Arc::new(api))?;
    Ok(engine)
}

async fn serve(config: &FleetConfig, store: SqliteJobStore) -> anyhow::Result<()> {
    let engine = Arc::new(build_engine(config, store)?);

    if config.trigger.api_keys.is_empty() {
        tracing::warn!("trigger.api_keys is empty; manual trigger calls will be rejected");
    }

    let cancel = CancellationToken::new();
    let ticker = config.engine.poll_interval_secs.filter(|s| *s > 0).map(|secs| {
        tokio::spawn(ticker::run_periodic(
            Arc::clone(&engine),
            Duration::from_secs(secs),
            cancel.clone(),
        ))
    });

    let state = Arc::new(app::AppState::new(
        Arc::clone(&engine),
        config.trigger.api_keys.clone(),
    ));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("fleetsched listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;

    // stop the periodic trigger; a claimed job finishes before it returns
    cancel.cancel();
    if let Some(handle) = ticker {
        handle.await?;
    }
    Ok(())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) -> std::io::Result<()> {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
