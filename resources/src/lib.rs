//! # TrainForge Resource Manager
//!
//! Authoritative in-process ledger of the GPUs and CPU cores on one host.
//! Discovery probes NVML first, then the `nvidia-smi` CSV interface, and
//! finally synthesizes a mock device table for development machines.
//! Allocation state only ever changes under the owning manager's mutex;
//! background samplers refresh dynamic metrics but never touch allocations.

pub mod cpu;
pub mod gpu;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use trainforge_proto::ResourceRequest;

pub use cpu::{CpuCore, CpuManager, CpuNode, CpuSnapshot, CpuStatus};
pub use gpu::{GpuDevice, GpuManager, GpuProvider, GpuSnapshot, GpuStatus};

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for resource management
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not enough free GPUs satisfying the memory floor
    #[error("insufficient GPUs: requested {requested}, {available} satisfy the request")]
    InsufficientGpus { requested: u32, available: u32 },

    /// Not enough free CPU cores or host memory
    #[error("insufficient CPUs: requested {requested} cores / {memory_gib} GiB")]
    InsufficientCpus { requested: u32, memory_gib: f64 },

    /// Device discovery or sampling failure
    #[error("device error: {0}")]
    Device(String),
}

/// Everything a job holds on one host.
///
/// Created atomically when the worker takes a job, destroyed (via
/// [`HostResources::release`]) at the job's terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub job_id: String,
    pub gpu_indices: Vec<u32>,
    pub cpu_cores: Vec<usize>,
    pub node_indices: Vec<usize>,
    /// Total reserved GPU memory (floor x device count) in MiB
    pub reserved_memory_mib: u64,
    pub allocated_at: DateTime<Utc>,
    pub worker_id: String,
}

/// Combined view of the host ledgers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub gpu: GpuSnapshot,
    pub cpu: CpuSnapshot,
    pub active_allocations: usize,
}

/// Owns both device managers for one host and hands out combined
/// per-job allocations.
pub struct HostResources {
    worker_id: String,
    gpus: Arc<GpuManager>,
    cpus: Arc<CpuManager>,
    allocations: Mutex<HashMap<String, Allocation>>,
}

impl HostResources {
    pub fn new(worker_id: impl Into<String>, gpus: Arc<GpuManager>, cpus: Arc<CpuManager>) -> Self {
        Self {
            worker_id: worker_id.into(),
            gpus,
            cpus,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Discover local devices and build the combined ledger.
    pub fn discover(worker_id: impl Into<String>) -> Self {
        let gpus = Arc::new(GpuManager::discover());
        let cpus = Arc::new(CpuManager::discover());
        Self::new(worker_id, gpus, cpus)
    }

    pub fn gpus(&self) -> &Arc<GpuManager> {
        &self.gpus
    }

    pub fn cpus(&self) -> &Arc<CpuManager> {
        &self.cpus
    }

    /// Spawn the background samplers for both managers.
    pub fn start_samplers(&self) {
        gpu::spawn_sampler(self.gpus.clone());
        cpu::spawn_sampler(self.cpus.clone());
    }

    /// Check whether a request would currently fit, without allocating.
    pub fn fits(&self, req: &ResourceRequest) -> bool {
        self.gpus.can_allocate(req.gpus, req.memory_per_gpu_mib)
            && self.cpus.can_allocate(req.cpus as usize, req.memory_gib)
    }

    /// Atomically allocate GPUs then CPUs for a job.
    ///
    /// If the CPU allocation fails the GPU allocation is rolled back, so no
    /// partial allocation is ever observable.
    pub fn allocate(&self, job_id: &str, req: &ResourceRequest) -> Result<Allocation> {
        let gpu_indices = self
            .gpus
            .allocate(job_id, req.gpus, req.memory_per_gpu_mib)?;

        let (cpu_cores, node_indices) =
            match self.cpus.allocate(job_id, req.cpus as usize, req.memory_gib) {
                Ok(alloc) => alloc,
                Err(e) => {
                    self.gpus.release(job_id);
                    return Err(e);
                }
            };

        let allocation = Allocation {
            job_id: job_id.to_string(),
            reserved_memory_mib: req.memory_per_gpu_mib * gpu_indices.len() as u64,
            gpu_indices,
            cpu_cores,
            node_indices,
            allocated_at: Utc::now(),
            worker_id: self.worker_id.clone(),
        };

        self.allocations
            .lock()
            .insert(job_id.to_string(), allocation.clone());

        info!(
            job_id,
            gpus = allocation.gpu_indices.len(),
            cores = allocation.cpu_cores.len(),
            "resources allocated"
        );
        Ok(allocation)
    }

    /// Free everything held by a job. Idempotent.
    pub fn release(&self, job_id: &str) {
        self.gpus.release(job_id);
        self.cpus.release(job_id);
        if self.allocations.lock().remove(job_id).is_some() {
            info!(job_id, "resources released");
        } else {
            debug!(job_id, "release for unknown job ignored");
        }
    }

    pub fn allocation(&self, job_id: &str) -> Option<Allocation> {
        self.allocations.lock().get(job_id).cloned()
    }

    pub fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            gpu: self.gpus.snapshot(),
            cpu: self.cpus.snapshot(),
            active_allocations: self.allocations.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_host() -> HostResources {
        HostResources::new(
            "worker-test",
            Arc::new(GpuManager::mock()),
            Arc::new(CpuManager::with_topology(8, 16.0)),
        )
    }

    #[test]
    fn test_allocate_and_release() {
        let host = test_host();
        let req = ResourceRequest {
            gpus: 1,
            memory_per_gpu_mib: 4096,
            cpus: 2,
            memory_gib: 2.0,
        };

        let alloc = host.allocate("job-1", &req).unwrap();
        assert_eq!(alloc.gpu_indices.len(), 1);
        assert_eq!(alloc.cpu_cores.len(), 2);
        assert_eq!(alloc.reserved_memory_mib, 4096);
        assert!(host.allocation("job-1").is_some());

        host.release("job-1");
        assert!(host.allocation("job-1").is_none());
        // Releasing again is a no-op.
        host.release("job-1");
    }

    #[test]
    fn test_gpu_rollback_on_cpu_failure() {
        let host = test_host();
        let req = ResourceRequest {
            gpus: 1,
            memory_per_gpu_mib: 1024,
            cpus: 64, // more cores than the topology has
            memory_gib: 1.0,
        };

        assert!(host.allocate("job-1", &req).is_err());

        // The GPU taken in step one must have been returned.
        let snap = host.gpus().snapshot();
        assert_eq!(snap.available_gpus, snap.total_gpus);
        assert!(host.allocation("job-1").is_none());
    }

    #[test]
    fn test_fits_matches_allocate() {
        let host = test_host();
        let good = ResourceRequest {
            gpus: 2,
            memory_per_gpu_mib: 1024,
            cpus: 4,
            memory_gib: 4.0,
        };
        let bad = ResourceRequest {
            gpus: 3,
            ..good.clone()
        };

        assert!(host.fits(&good));
        assert!(!host.fits(&bad));
    }
}
