//! Job configuration and lifecycle types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the scheduler queue
    #[default]
    Pending,
    /// Offered to or taken by a worker, not yet running
    Claimed,
    /// Executing on a worker
    Running,
    /// Finished with exit code 0
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the client or at shutdown
    Cancelled,
}

impl JobStatus {
    /// Terminal states permit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    /// Base queue score; lower runs first.
    pub fn base_score(&self) -> i64 {
        match self {
            Self::Urgent => 0,
            Self::High => 100,
            Self::Normal => 200,
            Self::Low => 300,
        }
    }
}

/// Declared resource requirements for one training process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Number of GPUs (0 is valid for CPU-only jobs)
    #[serde(default = "default_gpus")]
    pub gpus: u32,
    /// Minimum free memory per GPU in MiB
    #[serde(default = "default_gpu_memory")]
    pub memory_per_gpu_mib: u64,
    /// Number of CPU cores
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Host memory floor in GiB
    #[serde(default = "default_memory_gib")]
    pub memory_gib: f64,
}

fn default_gpus() -> u32 {
    1
}
fn default_gpu_memory() -> u64 {
    4096
}
fn default_cpus() -> u32 {
    1
}
fn default_memory_gib() -> f64 {
    1.0
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            gpus: default_gpus(),
            memory_per_gpu_mib: default_gpu_memory(),
            cpus: default_cpus(),
            memory_gib: default_memory_gib(),
        }
    }
}

/// Rendezvous coordinates injected into each distributed training process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistConfig {
    /// This process's rank, 0-based
    pub rank: u32,
    /// Total number of participating processes
    pub world_size: u32,
    /// Reachable address of the rank-0 worker
    pub master_addr: String,
    /// Rendezvous port chosen by the scheduler
    pub master_port: u16,
}

/// Declarative job configuration submitted alongside the project archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Project name
    pub project: String,
    /// Training entrypoint, relative to the project root
    pub entrypoint: String,
    /// Optional shell command run before the entrypoint
    #[serde(default)]
    pub setup_command: Option<String>,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub priority: JobPriority,
    /// Free-form environment passed through to the training process
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Container image override
    #[serde(default)]
    pub image: Option<String>,
    /// Number of workers for distributed training (1 = single worker)
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,
}

fn default_num_workers() -> u32 {
    1
}

impl JobConfig {
    /// Jobs spanning more than one worker run in distributed mode.
    pub fn is_distributed(&self) -> bool {
        self.num_workers > 1
    }
}

/// One GPU as reported in worker capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSummary {
    /// Local device index
    pub index: u32,
    /// Device name, e.g. "NVIDIA A100-SXM4-80GB"
    pub name: String,
    /// Total device memory in MiB
    pub memory_mib: u64,
    /// Synthesized device (development/CI); never matched to real GPU jobs
    #[serde(default)]
    pub mock: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"cancelled\"").unwrap(),
            JobStatus::Cancelled
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Claimed.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Urgent.base_score() < JobPriority::High.base_score());
        assert!(JobPriority::High.base_score() < JobPriority::Normal.base_score());
        assert!(JobPriority::Normal.base_score() < JobPriority::Low.base_score());
    }

    #[test]
    fn test_config_defaults() {
        let config: JobConfig =
            serde_json::from_str(r#"{"project": "mnist", "entrypoint": "train.py"}"#).unwrap();

        assert_eq!(config.resources.gpus, 1);
        assert_eq!(config.resources.memory_per_gpu_mib, 4096);
        assert_eq!(config.priority, JobPriority::Normal);
        assert_eq!(config.num_workers, 1);
        assert!(!config.is_distributed());
    }
}
