//! Worker runtime: the register/heartbeat/poll/claim/execute loop

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trainforge_proto::{
    DistConfig, GpuSummary, HeartbeatRequest, JobStatus, PendingJob, RegisterRequest,
    StatusUpdate, WorkerCapabilities,
};
use trainforge_resources::HostResources;
use trainforge_supervisor::{LaunchSpec, Supervisor};

use crate::client::ApiClient;
use crate::fetch;
use crate::logs::LogShipper;
use crate::results;

/// Liveness report cadence
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
/// Consecutive heartbeat failures before a reconnect cycle
const HEARTBEAT_FAILURE_LIMIT: u32 = 3;
/// Poll cadence while idle
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Poll cadence while jobs are running
const BUSY_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Reconnect backoff bounds
const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(120);
/// Grace given to a cancelled training process before a forced kill
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub platform: String,
    pub work_dir: PathBuf,
    pub max_concurrent_jobs: u32,
}

struct ActiveJob {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// The execution agent on one host.
pub struct Worker {
    config: WorkerConfig,
    client: Arc<ApiClient>,
    resources: Arc<HostResources>,
    supervisor: Arc<Supervisor>,
    active: Mutex<HashMap<String, ActiveJob>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        client: Arc<ApiClient>,
        resources: Arc<HostResources>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            config,
            client,
            resources,
            supervisor,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The outer loop. Any failure of any step falls back to waiting for
    /// the API and re-registering; the process never exits on its own.
    pub async fn run(self: &Arc<Self>) {
        let mut delay = RECONNECT_BASE;
        loop {
            while !self.client.healthy().await {
                info!(delay_secs = delay.as_secs(), "API unreachable, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX);
            }
            delay = RECONNECT_BASE;

            if let Err(e) = self.register().await {
                warn!("registration failed, will retry: {}", e);
                tokio::time::sleep(Duration::from_secs(10)).await;
                continue;
            }
            info!(
                worker_id = %self.config.worker_id,
                api = %self.client.base_url(),
                "registered with control plane"
            );

            if let Err(e) = self.serve().await {
                warn!("worker loop error, reconnecting: {}", e);
                tokio::time::sleep(RECONNECT_BASE).await;
            }
        }
    }

    async fn register(&self) -> Result<()> {
        self.client
            .register(&RegisterRequest {
                worker_id: self.config.worker_id.clone(),
                platform: self.config.platform.clone(),
                capabilities: self.capabilities(),
            })
            .await
    }

    fn capabilities(&self) -> WorkerCapabilities {
        let snapshot = self.resources.snapshot();
        let mock = self.resources.gpus().is_mock();

        WorkerCapabilities {
            gpu_count: snapshot.gpu.total_gpus as u32,
            gpus: snapshot
                .gpu
                .devices
                .iter()
                .map(|d| GpuSummary {
                    index: d.index,
                    name: d.name.clone(),
                    memory_mib: d.memory_total_mib,
                    mock,
                })
                .collect(),
            cpu_count: snapshot.cpu.total_cores as u32,
            memory_gib: snapshot.cpu.total_memory_gib,
            docker_available: self.supervisor.docker_available(),
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            address: local_address(),
        }
    }

    /// Heartbeat + poll loop; returns Err to trigger a reconnect cycle.
    async fn serve(self: &Arc<Self>) -> Result<()> {
        let mut heartbeat_failures = 0u32;
        let mut last_heartbeat: Option<Instant> = None;

        loop {
            let due = last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT_INTERVAL);
            if due {
                match self.send_heartbeat().await {
                    Ok(response) => {
                        heartbeat_failures = 0;
                        for job_id in response.cancel_jobs {
                            self.cancel_local(&job_id);
                        }
                    }
                    Err(e) => {
                        heartbeat_failures += 1;
                        warn!(heartbeat_failures, "heartbeat failed: {}", e);
                        if heartbeat_failures >= HEARTBEAT_FAILURE_LIMIT {
                            bail!(
                                "heartbeat failed {} consecutive times",
                                heartbeat_failures
                            );
                        }
                    }
                }
                last_heartbeat = Some(Instant::now());
            }

            let running = self.active.lock().len() as u32;
            if running < self.config.max_concurrent_jobs {
                match self.client.pending_jobs(&self.config.worker_id).await {
                    Ok(jobs) => self.consider_jobs(jobs).await,
                    Err(e) => debug!("job poll failed: {}", e),
                }
            }

            let pause = if self.active.lock().is_empty() {
                POLL_INTERVAL
            } else {
                BUSY_POLL_INTERVAL
            };
            tokio::time::sleep(pause).await;
        }
    }

    async fn send_heartbeat(&self) -> Result<trainforge_proto::HeartbeatResponse> {
        let current_job_ids: Vec<String> = self.active.lock().keys().cloned().collect();
        self.client
            .heartbeat(
                &self.config.worker_id,
                &HeartbeatRequest {
                    timestamp: Utc::now(),
                    current_job_ids,
                },
            )
            .await
    }

    /// Pick the first offered job that fits local free resources.
    async fn consider_jobs(self: &Arc<Self>, jobs: Vec<PendingJob>) {
        for job in jobs {
            {
                let active = self.active.lock();
                if active.len() as u32 >= self.config.max_concurrent_jobs
                    || active.contains_key(&job.job_id)
                {
                    continue;
                }
            }
            if !self.resources.fits(&job.resources) {
                debug!(job_id = %job.job_id, "offered job does not fit free resources");
                continue;
            }
            self.try_start(job).await;
        }
    }

    /// Allocate locally, then claim; a lost race releases the allocation.
    async fn try_start(self: &Arc<Self>, job: PendingJob) {
        let job_id = job.job_id.clone();

        if self
            .resources
            .allocate(&job_id, &job.resources)
            .is_err()
        {
            debug!(job_id, "local allocation failed, leaving job pending");
            return;
        }

        let claim = match self.client.claim(&job_id, &self.config.worker_id).await {
            Ok(claim) if claim.success => claim,
            Ok(claim) => {
                debug!(
                    job_id,
                    message = claim.message.as_deref().unwrap_or(""),
                    "claim lost, another worker was first"
                );
                self.resources.release(&job_id);
                return;
            }
            Err(e) => {
                warn!(job_id, "claim failed: {}", e);
                self.resources.release(&job_id);
                return;
            }
        };

        info!(job_id, distributed = claim.is_distributed, "job claimed");

        let token = CancellationToken::new();
        self.active.lock().insert(
            job_id.clone(),
            ActiveJob {
                cancel: token.clone(),
                task: None,
            },
        );

        let worker = self.clone();
        let dist = claim.dist_config;
        let task_job_id = job_id.clone();
        let task = tokio::spawn(async move {
            worker.execute_job(job, dist, token).await;
            worker.active.lock().remove(&task_job_id);
        });

        if let Some(entry) = self.active.lock().get_mut(&job_id) {
            entry.task = Some(task);
        }
    }

    /// Full pipeline for one claimed job: fetch, setup, execute, report,
    /// release, clean up. Always reaches a terminal report.
    async fn execute_job(
        self: &Arc<Self>,
        job: PendingJob,
        dist: Option<DistConfig>,
        token: CancellationToken,
    ) {
        let job_id = job.job_id.clone();
        let _ = self
            .client
            .update_status(
                &job_id,
                &StatusUpdate {
                    status: JobStatus::Running,
                    message: Some("initializing".to_string()),
                    progress: None,
                },
            )
            .await;

        let (lines, receiver) = mpsc::unbounded_channel();
        let shipper = LogShipper::spawn(self.client.clone(), job_id.clone(), receiver);

        let (status, message) = self.run_stages(&job, dist, &token, &lines).await;

        drop(lines);
        shipper.finish().await;

        let progress = (status == JobStatus::Completed).then_some(100.0);
        if let Err(e) = self
            .client
            .update_status(
                &job_id,
                &StatusUpdate {
                    status,
                    message: message.clone(),
                    progress,
                },
            )
            .await
        {
            warn!(job_id, "failed to report terminal status: {}", e);
        }

        self.resources.release(&job_id);
        fetch::cleanup_scratch(&self.config.work_dir, &job_id).await;
        info!(job_id, status = %status, "job finished");
    }

    async fn run_stages(
        &self,
        job: &PendingJob,
        dist: Option<DistConfig>,
        token: &CancellationToken,
        lines: &mpsc::UnboundedSender<String>,
    ) -> (JobStatus, Option<String>) {
        let job_id = &job.job_id;

        let job_dir = match fetch::fetch_project(
            &self.client,
            job_id,
            &self.config.work_dir,
            &job.entrypoint,
        )
        .await
        {
            Ok(dir) => dir,
            Err(e) => return (JobStatus::Failed, Some(format!("{:#}", e))),
        };

        if token.is_cancelled() {
            return (
                JobStatus::Cancelled,
                Some("cancelled before start".to_string()),
            );
        }

        if let Some(command) = &job.setup_command {
            if let Err(e) = fetch::run_setup(&job_dir, command, lines).await {
                return (JobStatus::Failed, Some(format!("{:#}", e)));
            }
        }

        let gpu_indices = self
            .resources
            .allocation(job_id)
            .map(|a| a.gpu_indices)
            .unwrap_or_default();

        let spec = LaunchSpec {
            job_id: job_id.clone(),
            project_dir: job_dir.clone(),
            entrypoint: job.entrypoint.clone(),
            gpu_indices,
            dist,
            extra_env: job
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            image: job.image.clone(),
        };

        let handle = match self.supervisor.start(&spec, lines.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                return (
                    JobStatus::Failed,
                    Some(format!("failed to start training: {}", e)),
                )
            }
        };

        let exit = tokio::select! {
            code = handle.wait() => Some(code),
            _ = token.cancelled() => None,
        };

        let outcome = match exit {
            Some(0) => {
                self.upload_results(job_id, &job_dir).await;
                (
                    JobStatus::Completed,
                    Some("training completed".to_string()),
                )
            }
            Some(code) => (
                JobStatus::Failed,
                Some(format!("ExecutionFailed: exit {}", code)),
            ),
            None => {
                info!(job_id, "cancellation observed, stopping training process");
                if let Err(e) = handle.stop(STOP_GRACE).await {
                    warn!(job_id, "failed to stop training process: {}", e);
                }
                (JobStatus::Cancelled, Some("cancelled by user".to_string()))
            }
        };

        if let Err(e) = handle.cleanup().await {
            warn!(job_id, "cleanup failed: {}", e);
        }
        outcome
    }

    async fn upload_results(&self, job_id: &str, job_dir: &std::path::Path) {
        let dir = job_dir.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || results::build_results_archive(&dir))
            .await;

        match archive {
            Ok(Ok(Some(path))) => {
                if let Err(e) = self.client.upload_results(job_id, &path).await {
                    warn!(job_id, "results upload failed: {}", e);
                }
            }
            Ok(Ok(None)) => debug!(job_id, "no result files to upload"),
            Ok(Err(e)) => warn!(job_id, "result collection failed: {}", e),
            Err(e) => warn!(job_id, "result collection task failed: {}", e),
        }
    }

    fn cancel_local(&self, job_id: &str) {
        match self.active.lock().get(job_id) {
            Some(entry) => {
                info!(job_id, "cancel signal received");
                entry.cancel.cancel();
            }
            None => debug!(job_id, "cancel for a job this worker is not running"),
        }
    }

    /// Graceful shutdown: cancel running jobs, wait for their terminal
    /// reports, then deregister.
    pub async fn shutdown(&self) {
        info!("worker shutting down");
        let jobs: Vec<(String, ActiveJob)> = self.active.lock().drain().collect();

        for (_, entry) in &jobs {
            entry.cancel.cancel();
        }
        for (job_id, entry) in jobs {
            if let Some(task) = entry.task {
                if tokio::time::timeout(Duration::from_secs(30), task)
                    .await
                    .is_err()
                {
                    warn!(job_id, "job did not stop within the shutdown window");
                }
            }
        }

        let _ = self.client.deregister(&self.config.worker_id).await;
    }
}

/// First non-loopback interface address, used as master_addr when this
/// worker hosts rank 0.
pub fn local_address() -> String {
    if let Ok(interfaces) = local_ip_address::list_afinet_netifas() {
        for (_, ip) in interfaces {
            if !ip.is_loopback() {
                return ip.to_string();
            }
        }
    }
    "127.0.0.1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainforge_resources::{CpuManager, GpuManager};
    use trainforge_supervisor::{BackendKind, SupervisorConfig};

    fn test_worker() -> Arc<Worker> {
        let resources = Arc::new(HostResources::new(
            "w-test",
            Arc::new(GpuManager::mock()),
            Arc::new(CpuManager::with_topology(8, 16.0)),
        ));
        Arc::new(Worker::new(
            WorkerConfig {
                worker_id: "w-test".to_string(),
                platform: "local".to_string(),
                work_dir: std::env::temp_dir().join("trainforge-test"),
                max_concurrent_jobs: 4,
            },
            Arc::new(ApiClient::new("http://localhost:1").unwrap()),
            resources,
            Arc::new(Supervisor::with_backend(
                BackendKind::Subprocess,
                SupervisorConfig::default(),
            )),
        ))
    }

    #[test]
    fn test_capabilities_carry_mock_marker() {
        let worker = test_worker();
        let caps = worker.capabilities();

        assert_eq!(caps.gpu_count, 2);
        assert!(caps.gpus.iter().all(|g| g.mock));
        assert_eq!(caps.cpu_count, 8);
        assert!(!caps.docker_available);
        assert_eq!(caps.max_concurrent_jobs, 4);
        assert!(!caps.address.is_empty());
    }

    #[test]
    fn test_cancel_for_unknown_job_is_benign() {
        let worker = test_worker();
        worker.cancel_local("not-running");
        assert!(worker.active.lock().is_empty());
    }

    #[test]
    fn test_local_address_is_parseable() {
        let addr = local_address();
        assert!(addr.parse::<std::net::IpAddr>().is_ok());
    }
}
