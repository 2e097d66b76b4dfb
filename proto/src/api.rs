//! HTTP request and response bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{DistConfig, GpuSummary, JobPriority, JobStatus, ResourceRequest};

/// Response to a job submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub resources: ResourceRequest,
    pub created_at: DateTime<Utc>,
}

/// Worker -> server status transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    #[serde(default)]
    pub message: Option<String>,
    /// Training progress percentage, 0-100
    #[serde(default)]
    pub progress: Option<f32>,
}

/// A single captured output line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered batch of log lines shipped by a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub logs: Vec<LogLine>,
}

/// Worker -> server claim attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
}

/// Claim arbitration result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub success: bool,
    #[serde(default)]
    pub is_distributed: bool,
    #[serde(default)]
    pub dist_config: Option<DistConfig>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Capabilities a worker reports at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub gpu_count: u32,
    #[serde(default)]
    pub gpus: Vec<GpuSummary>,
    pub cpu_count: u32,
    pub memory_gib: f64,
    #[serde(default)]
    pub docker_available: bool,
    pub max_concurrent_jobs: u32,
    /// Reachable address used as master_addr for distributed jobs
    pub address: String,
}

/// Worker registration payload; re-registering upserts the record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    /// Platform label, e.g. "local" or "colab"
    pub platform: String,
    pub capabilities: WorkerCapabilities,
}

/// Periodic liveness report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub current_job_ids: Vec<String>,
}

/// Heartbeat acknowledgment; carries pending cancellations back to the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    #[serde(default)]
    pub cancel_jobs: Vec<String>,
}

/// Queue view served to polling workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingJob {
    pub job_id: String,
    pub project: String,
    pub entrypoint: String,
    #[serde(default)]
    pub setup_command: Option<String>,
    pub resources: ResourceRequest,
    pub priority: JobPriority,
    #[serde(default)]
    pub environment: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub image: Option<String>,
    pub distributed: bool,
    pub world_size: u32,
    pub submitted_at: DateTime<Utc>,
}

/// Registered worker as listed by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub platform: String,
    pub status: String,
    pub gpu_count: u32,
    pub running_jobs: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

/// GET /health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
}
