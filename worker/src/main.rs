//! TrainForge worker entrypoint

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trainforge_resources::HostResources;
use trainforge_supervisor::{Supervisor, SupervisorConfig};

mod client;
mod fetch;
mod logs;
mod results;
mod runtime;

use client::ApiClient;
use runtime::{Worker, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "trainforge-worker", about = "TrainForge execution agent")]
struct Args {
    /// Control plane base URL
    #[arg(long, env = "TRAINFORGE_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Stable worker id; generated from hostname and pid when omitted
    #[arg(long)]
    worker_id: Option<String>,

    /// Platform label reported at registration
    #[arg(long, default_value = "local")]
    platform: String,

    /// Scratch directory for job workspaces
    #[arg(long, default_value = "./work")]
    work_dir: PathBuf,

    /// Maximum jobs executed in parallel
    #[arg(long, default_value_t = 4)]
    max_jobs: u32,

    /// Training interpreter
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Default container image
    #[arg(long, default_value = "pytorch/pytorch:latest")]
    image: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let worker_id = args.worker_id.clone().unwrap_or_else(default_worker_id);

    tokio::fs::create_dir_all(&args.work_dir).await?;

    let resources = Arc::new(HostResources::discover(&worker_id));
    resources.start_samplers();

    let supervisor = Arc::new(
        Supervisor::detect(SupervisorConfig {
            interpreter: args.interpreter.clone(),
            default_image: args.image.clone(),
        })
        .await,
    );

    let snapshot = resources.snapshot();
    info!(
        worker_id = %worker_id,
        api = %args.api_url,
        gpus = snapshot.gpu.total_gpus,
        cores = snapshot.cpu.total_cores,
        backend = ?supervisor.backend(),
        "worker starting"
    );

    let worker = Arc::new(Worker::new(
        WorkerConfig {
            worker_id,
            platform: args.platform,
            work_dir: args.work_dir,
            max_concurrent_jobs: args.max_jobs,
        },
        Arc::new(ApiClient::new(&args.api_url)?),
        resources,
        supervisor,
    ));

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            worker.shutdown().await;
        }
    }

    Ok(())
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("worker-{}-{}", host, std::process::id())
}
