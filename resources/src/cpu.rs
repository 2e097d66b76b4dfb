//! CPU topology discovery, allocation, and sampling

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::{Error, Result};

/// CPU sampling cadence
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Cores per allocation node; a NUMA-style grouping hint only
pub const CORES_PER_NODE: usize = 4;

const BUSY_UTILIZATION_PERCENT: f32 = 90.0;

/// Core state as tracked by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuStatus {
    Available,
    Allocated,
    Busy,
}

/// One logical core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuCore {
    pub index: usize,
    pub utilization_percent: f32,
    pub holder: Option<String>,
    pub status: CpuStatus,
}

/// A group of cores with its attributed memory share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuNode {
    pub index: usize,
    pub cores: Vec<CpuCore>,
    pub memory_gib: f64,
    /// Memory attributed to jobs via the allocation ledger
    pub memory_allocated_gib: f64,
    /// Sampled in-use memory, informational only
    pub memory_used_gib: f64,
}

impl CpuNode {
    pub fn available_cores(&self) -> usize {
        self.cores.iter().filter(|c| c.holder.is_none()).count()
    }

    pub fn memory_available_gib(&self) -> f64 {
        (self.memory_gib - self.memory_allocated_gib).max(0.0)
    }
}

/// Aggregate view for heartbeats and the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub total_cores: usize,
    pub available_cores: usize,
    pub physical_cores: usize,
    pub total_memory_gib: f64,
    pub available_memory_gib: f64,
    pub nodes: Vec<CpuNode>,
    pub active_jobs: usize,
}

#[derive(Debug, Clone)]
struct CpuAllocation {
    cores: Vec<usize>,
    node_indices: Vec<usize>,
    memory_gib: f64,
}

struct Ledger {
    nodes: Vec<CpuNode>,
    allocations: HashMap<String, CpuAllocation>,
}

/// Per-host CPU ledger. All state changes go through the single mutex.
pub struct CpuManager {
    physical_cores: usize,
    inner: Mutex<Ledger>,
    sys: Mutex<sysinfo::System>,
}

impl CpuManager {
    /// Discover the local topology via the OS.
    pub fn discover() -> Self {
        let logical = num_cpus::get();
        let physical = num_cpus::get_physical();
        let sys = sysinfo::System::new_all();
        let memory_gib = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

        info!(
            logical,
            physical,
            memory_gib = format!("{:.1}", memory_gib),
            "discovered CPU topology"
        );

        let mut manager = Self::with_topology(logical, memory_gib);
        manager.physical_cores = physical;
        *manager.sys.lock() = sys;
        manager
    }

    /// Build a ledger from an explicit core count and memory size.
    pub fn with_topology(logical_cores: usize, memory_gib: f64) -> Self {
        let logical_cores = logical_cores.max(1);
        let node_count = logical_cores.div_ceil(CORES_PER_NODE);
        let memory_per_node = memory_gib / node_count as f64;

        let nodes = (0..node_count)
            .map(|node_index| {
                let start = node_index * CORES_PER_NODE;
                let end = (start + CORES_PER_NODE).min(logical_cores);
                CpuNode {
                    index: node_index,
                    cores: (start..end)
                        .map(|index| CpuCore {
                            index,
                            utilization_percent: 0.0,
                            holder: None,
                            status: CpuStatus::Available,
                        })
                        .collect(),
                    memory_gib: memory_per_node,
                    memory_allocated_gib: 0.0,
                    memory_used_gib: 0.0,
                }
            })
            .collect();

        Self {
            physical_cores: logical_cores,
            inner: Mutex::new(Ledger {
                nodes,
                allocations: HashMap::new(),
            }),
            sys: Mutex::new(sysinfo::System::new()),
        }
    }

    /// Non-mutating fit check.
    pub fn can_allocate(&self, cores: usize, memory_gib: f64) -> bool {
        if cores == 0 {
            return true;
        }
        let ledger = self.inner.lock();
        let available: usize = ledger.nodes.iter().map(|n| n.available_cores()).sum();
        let memory: f64 = ledger.nodes.iter().map(|n| n.memory_available_gib()).sum();
        available >= cores && memory >= memory_gib
    }

    /// Allocate cores with a single-node preference.
    pub fn allocate(
        &self,
        job_id: &str,
        cores: usize,
        memory_gib: f64,
    ) -> Result<(Vec<usize>, Vec<usize>)> {
        self.allocate_with(job_id, cores, memory_gib, true)
    }

    /// Allocate cores, either packed onto one node or spread greedily.
    pub fn allocate_with(
        &self,
        job_id: &str,
        cores: usize,
        memory_gib: f64,
        prefer_single_node: bool,
    ) -> Result<(Vec<usize>, Vec<usize>)> {
        if cores == 0 {
            return Ok((vec![], vec![]));
        }

        let mut ledger = self.inner.lock();

        let total_available: usize = ledger.nodes.iter().map(|n| n.available_cores()).sum();
        let total_memory: f64 = ledger.nodes.iter().map(|n| n.memory_available_gib()).sum();
        if total_available < cores || total_memory < memory_gib {
            return Err(Error::InsufficientCpus {
                requested: cores as u32,
                memory_gib,
            });
        }

        // Node order: descending available cores, ties on lowest index.
        let mut order: Vec<usize> = (0..ledger.nodes.len()).collect();
        order.sort_by(|&a, &b| {
            ledger.nodes[b]
                .available_cores()
                .cmp(&ledger.nodes[a].available_cores())
                .then(a.cmp(&b))
        });

        let plan: Vec<(usize, usize)> = if prefer_single_node {
            match order.iter().find(|&&n| {
                ledger.nodes[n].available_cores() >= cores
                    && ledger.nodes[n].memory_available_gib() >= memory_gib
            }) {
                Some(&n) => vec![(n, cores)],
                None => spread_plan(&ledger.nodes, &order, cores),
            }
        } else {
            spread_plan(&ledger.nodes, &order, cores)
        };

        let memory_share = memory_gib / plan.len() as f64;
        let mut allocated_cores = Vec::with_capacity(cores);
        let mut node_indices = Vec::with_capacity(plan.len());

        for (node_index, take) in plan {
            let node = &mut ledger.nodes[node_index];
            let mut taken = 0;
            for core in node.cores.iter_mut() {
                if taken == take {
                    break;
                }
                if core.holder.is_none() {
                    core.holder = Some(job_id.to_string());
                    core.status = CpuStatus::Allocated;
                    allocated_cores.push(core.index);
                    taken += 1;
                }
            }
            node.memory_allocated_gib += memory_share;
            node_indices.push(node_index);
        }

        ledger.allocations.insert(
            job_id.to_string(),
            CpuAllocation {
                cores: allocated_cores.clone(),
                node_indices: node_indices.clone(),
                memory_gib,
            },
        );

        info!(job_id, cores = allocated_cores.len(), ?node_indices, "allocated CPUs");
        Ok((allocated_cores, node_indices))
    }

    /// Free every core held by `job_id`. Idempotent.
    pub fn release(&self, job_id: &str) {
        let mut ledger = self.inner.lock();

        let Some(allocation) = ledger.allocations.remove(job_id) else {
            return;
        };

        let memory_share = allocation.memory_gib / allocation.node_indices.len().max(1) as f64;
        for &node_index in &allocation.node_indices {
            if let Some(node) = ledger.nodes.get_mut(node_index) {
                node.memory_allocated_gib = (node.memory_allocated_gib - memory_share).max(0.0);
            }
        }

        for node in ledger.nodes.iter_mut() {
            for core in node.cores.iter_mut() {
                if core.holder.as_deref() == Some(job_id) {
                    core.holder = None;
                    core.status = CpuStatus::Available;
                }
            }
        }

        info!(job_id, cores = allocation.cores.len(), "released CPUs");
    }

    /// Core indices held by a job, for invariant checks and diagnostics.
    pub fn cores_held_by(&self, job_id: &str) -> Vec<usize> {
        let ledger = self.inner.lock();
        ledger
            .nodes
            .iter()
            .flat_map(|n| n.cores.iter())
            .filter(|c| c.holder.as_deref() == Some(job_id))
            .map(|c| c.index)
            .collect()
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        let ledger = self.inner.lock();
        CpuSnapshot {
            total_cores: ledger.nodes.iter().map(|n| n.cores.len()).sum(),
            available_cores: ledger.nodes.iter().map(|n| n.available_cores()).sum(),
            physical_cores: self.physical_cores,
            total_memory_gib: ledger.nodes.iter().map(|n| n.memory_gib).sum(),
            available_memory_gib: ledger.nodes.iter().map(|n| n.memory_available_gib()).sum(),
            nodes: ledger.nodes.clone(),
            active_jobs: ledger.allocations.len(),
        }
    }

    /// Refresh per-core utilization and memory from the OS.
    pub fn sample(&self) {
        let usages: Vec<f32>;
        let used_memory_gib: f64;
        {
            let mut sys = self.sys.lock();
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            usages = sys.cpus().iter().map(|c| c.cpu_usage()).collect();
            used_memory_gib = sys.used_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        }

        let mut ledger = self.inner.lock();
        let node_count = ledger.nodes.len().max(1);
        for node in ledger.nodes.iter_mut() {
            node.memory_used_gib = used_memory_gib / node_count as f64;
            for core in node.cores.iter_mut() {
                if let Some(&usage) = usages.get(core.index) {
                    core.utilization_percent = usage;
                }
                core.status = if core.holder.is_some() {
                    CpuStatus::Allocated
                } else if core.utilization_percent > BUSY_UTILIZATION_PERCENT {
                    CpuStatus::Busy
                } else {
                    CpuStatus::Available
                };
            }
        }
    }
}

fn spread_plan(nodes: &[CpuNode], order: &[usize], cores: usize) -> Vec<(usize, usize)> {
    let mut plan = vec![];
    let mut remaining = cores;
    for &node_index in order {
        if remaining == 0 {
            break;
        }
        let take = nodes[node_index].available_cores().min(remaining);
        if take > 0 {
            plan.push((node_index, take));
            remaining -= take;
        }
    }
    plan
}

/// Spawn the background sampling task for a manager.
pub fn spawn_sampler(manager: Arc<CpuManager>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            interval.tick().await;
            let m = manager.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || m.sample()).await {
                warn!("CPU sampler task panicked: {}", e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_nodes_of_four() {
        let manager = CpuManager::with_topology(10, 20.0);
        let snap = manager.snapshot();

        assert_eq!(snap.nodes.len(), 3);
        assert_eq!(snap.nodes[0].cores.len(), 4);
        assert_eq!(snap.nodes[2].cores.len(), 2);
        assert_eq!(snap.total_cores, 10);
    }

    #[test]
    fn test_single_node_preference() {
        let manager = CpuManager::with_topology(8, 16.0);

        // Occupy half of node 0 so node 1 has more free cores.
        manager.allocate("job-a", 2, 1.0).unwrap();

        let (cores, nodes) = manager.allocate("job-b", 3, 1.0).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(cores.len(), 3);
        // All three cores come from the same node.
        let node = cores[0] / CORES_PER_NODE;
        assert!(cores.iter().all(|c| c / CORES_PER_NODE == node));
    }

    #[test]
    fn test_spread_when_no_single_node_fits() {
        let manager = CpuManager::with_topology(8, 16.0);

        let (cores, nodes) = manager.allocate("job-a", 6, 2.0).unwrap();
        assert_eq!(cores.len(), 6);
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_insufficient_cores() {
        let manager = CpuManager::with_topology(4, 8.0);
        let err = manager.allocate("job-a", 5, 1.0).unwrap_err();
        assert!(matches!(err, Error::InsufficientCpus { requested: 5, .. }));
        assert_eq!(manager.snapshot().available_cores, 4);
    }

    #[test]
    fn test_insufficient_memory() {
        let manager = CpuManager::with_topology(4, 8.0);
        assert!(manager.allocate("job-a", 1, 100.0).is_err());
    }

    #[test]
    fn test_holder_set_matches_allocation() {
        let manager = CpuManager::with_topology(8, 16.0);

        let (cores, _) = manager.allocate("job-a", 3, 1.0).unwrap();
        let mut held = manager.cores_held_by("job-a");
        held.sort_unstable();
        let mut expected = cores.clone();
        expected.sort_unstable();
        assert_eq!(held, expected);

        manager.release("job-a");
        assert!(manager.cores_held_by("job-a").is_empty());
    }

    #[test]
    fn test_release_restores_memory() {
        let manager = CpuManager::with_topology(8, 16.0);

        let before = manager.snapshot().available_memory_gib;
        manager.allocate("job-a", 2, 4.0).unwrap();
        assert!(manager.snapshot().available_memory_gib < before);

        manager.release("job-a");
        let after = manager.snapshot().available_memory_gib;
        assert!((after - before).abs() < 1e-9);

        manager.release("job-a");
    }

    #[test]
    fn test_zero_cores_is_noop() {
        let manager = CpuManager::with_topology(4, 8.0);
        let (cores, nodes) = manager.allocate("job-a", 0, 0.0).unwrap();
        assert!(cores.is_empty());
        assert!(nodes.is_empty());
        assert_eq!(manager.snapshot().active_jobs, 0);
    }
}
