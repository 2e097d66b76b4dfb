//! Worker registry

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use trainforge_proto::{WorkerCapabilities, WorkerSummary};

/// Liveness as derived from heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Unreachable,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A registered worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub platform: String,
    pub capabilities: WorkerCapabilities,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub running_jobs: Vec<String>,
    /// Set once the silence window elapses; cleared by the next heartbeat
    pub unreachable: bool,
}

impl WorkerRecord {
    /// Strictly greater than the window: a heartbeat exactly at the
    /// threshold is still reachable.
    pub fn is_stale(&self, window: Duration) -> bool {
        Utc::now() - self.last_heartbeat > window
    }

    pub fn status(&self, window: Duration) -> WorkerStatus {
        if self.unreachable || self.is_stale(window) {
            WorkerStatus::Unreachable
        } else if self.running_jobs.is_empty() {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        }
    }

    pub fn free_slots(&self) -> u32 {
        self.capabilities
            .max_concurrent_jobs
            .saturating_sub(self.running_jobs.len() as u32)
    }

    /// Largest single device, used against per-GPU memory floors.
    pub fn largest_gpu_mib(&self) -> u64 {
        self.capabilities
            .gpus
            .iter()
            .map(|g| g.memory_mib)
            .max()
            .unwrap_or(0)
    }

    /// Whether any reported device is real hardware.
    pub fn has_real_gpus(&self) -> bool {
        self.capabilities.gpus.iter().any(|g| !g.mock)
    }
}

/// All workers known to the control plane.
///
/// The control plane's fleet view is built purely from these reports; the
/// per-device ledgers live in the worker processes.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRecord>>,
    silence_window: Duration,
}

impl WorkerRegistry {
    pub fn new(silence_window_secs: i64) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            silence_window: Duration::seconds(silence_window_secs),
        }
    }

    /// Register or update a worker. Idempotent: re-registering with the
    /// same capabilities only refreshes the heartbeat.
    pub fn register(&self, id: &str, platform: &str, capabilities: WorkerCapabilities) {
        let mut workers = self.workers.write();
        let now = Utc::now();

        match workers.get_mut(id) {
            Some(existing) => {
                existing.platform = platform.to_string();
                existing.capabilities = capabilities;
                existing.last_heartbeat = now;
                existing.unreachable = false;
                info!(worker_id = id, "worker re-registered");
            }
            None => {
                workers.insert(
                    id.to_string(),
                    WorkerRecord {
                        id: id.to_string(),
                        platform: platform.to_string(),
                        capabilities,
                        registered_at: now,
                        last_heartbeat: now,
                        running_jobs: vec![],
                        unreachable: false,
                    },
                );
                info!(worker_id = id, platform, "worker registered");
            }
        }
    }

    /// Record a heartbeat. Returns false for unknown workers, which should
    /// re-register.
    pub fn heartbeat(&self, id: &str, running_jobs: Vec<String>) -> bool {
        let mut workers = self.workers.write();
        match workers.get_mut(id) {
            Some(worker) => {
                worker.last_heartbeat = Utc::now();
                worker.running_jobs = running_jobs;
                worker.unreachable = false;
                true
            }
            None => false,
        }
    }

    pub fn deregister(&self, id: &str) -> Option<WorkerRecord> {
        self.workers.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.workers.read().get(id).cloned()
    }

    /// Workers that can currently be offered work.
    pub fn available_workers(&self) -> Vec<WorkerRecord> {
        self.workers
            .read()
            .values()
            .filter(|w| w.status(self.silence_window) != WorkerStatus::Unreachable)
            .filter(|w| w.free_slots() > 0)
            .cloned()
            .collect()
    }

    /// Workers whose heartbeat silence exceeded the window and that are not
    /// yet flagged; flags them and returns the newly unreachable records.
    pub fn sweep_unreachable(&self) -> Vec<WorkerRecord> {
        let mut workers = self.workers.write();
        let mut newly = vec![];
        for worker in workers.values_mut() {
            if !worker.unreachable && worker.is_stale(self.silence_window) {
                worker.unreachable = true;
                worker.running_jobs.clear();
                newly.push(worker.clone());
            }
        }
        newly
    }

    pub fn summaries(&self) -> Vec<WorkerSummary> {
        self.workers
            .read()
            .values()
            .map(|w| WorkerSummary {
                worker_id: w.id.clone(),
                platform: w.platform.clone(),
                status: w.status(self.silence_window).to_string(),
                gpu_count: w.capabilities.gpu_count,
                running_jobs: w.running_jobs.clone(),
                last_heartbeat: w.last_heartbeat,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    pub fn silence_window(&self) -> Duration {
        self.silence_window
    }
}
