//! TrainForge control plane entrypoint

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trainforge_scheduler::{JobStore, Scheduler, SchedulerConfig, StoreConfig};

mod routes;
mod state;
mod storage;

use state::AppState;
use storage::ArchiveStore;

/// Cadence of the scheduler maintenance sweep
const TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "trainforge-control-plane", about = "TrainForge control plane")]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Job table directory
    #[arg(long, default_value = "./data/control-plane")]
    data_dir: PathBuf,

    /// Project/result archive directory
    #[arg(long, default_value = "./data/storage")]
    storage_dir: PathBuf,

    /// Seconds a claimed-pending offer stays reserved
    #[arg(long, default_value_t = 30)]
    claim_window_secs: i64,

    /// Heartbeat silence before a worker is unreachable
    #[arg(long, default_value_t = 90)]
    heartbeat_timeout_secs: i64,

    /// Reclaims before a job fails for worker loss
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = JobStore::new(StoreConfig {
        data_dir: args.data_dir.clone(),
        sync_writes: true,
    })
    .context("failed to open job store")?;

    let scheduler = Arc::new(
        Scheduler::new(
            SchedulerConfig {
                claim_window_secs: args.claim_window_secs,
                heartbeat_timeout_secs: args.heartbeat_timeout_secs,
                max_attempts: args.max_attempts,
                ..Default::default()
            },
            store,
        )
        .context("failed to build scheduler")?,
    );

    let archives =
        ArchiveStore::new(args.storage_dir.clone()).context("failed to open archive store")?;

    // Maintenance sweep: claim expiry and unreachable-worker reclaim.
    let sweeper = scheduler.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            sweeper.tick();
        }
    });

    let app = routes::create_router(Arc::new(AppState { scheduler, archives }));

    let addr = format!("{}:{}", args.host, args.port);
    info!(%addr, "control plane listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
