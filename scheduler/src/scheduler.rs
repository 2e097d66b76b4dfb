//! Placement, claim arbitration, and lifecycle sweeps

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use priority_queue::PriorityQueue;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use trainforge_proto::{
    ClaimResponse, DistConfig, HeartbeatResponse, JobConfig, JobStatus, LogLine, PendingJob,
    RegisterRequest, ResourceRequest, StatusUpdate,
};

use crate::job::JobRecord;
use crate::store::JobStore;
use crate::workers::{WorkerRecord, WorkerRegistry};
use crate::{Error, Result};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Window a claimed-pending offer stays reserved for its worker(s)
    pub claim_window_secs: i64,
    /// Heartbeat silence after which a worker is unreachable
    pub heartbeat_timeout_secs: i64,
    /// Reclaims before a job fails with a worker-unreachable reason
    pub max_attempts: u32,
    /// Inclusive port range for distributed rendezvous masters
    pub master_port_range: (u16, u16),
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            claim_window_secs: 30,
            heartbeat_timeout_secs: 90,
            max_attempts: 3,
            master_port_range: (29500, 29999),
        }
    }
}

/// Counts reported by GET /api/status
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub pending_jobs: usize,
    pub claimed_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub workers: usize,
    pub available_workers: usize,
}

#[derive(Debug, Clone)]
struct Participant {
    rank: u32,
    claimed: bool,
}

#[derive(Debug, Clone)]
struct DistInfo {
    world_size: u32,
    master_addr: String,
    master_port: u16,
}

/// A claimed-pending reservation; distributed jobs reserve several workers.
#[derive(Debug, Clone)]
struct ClaimEntry {
    expires_at: DateTime<Utc>,
    participants: HashMap<String, Participant>,
    dist: Option<DistInfo>,
}

impl ClaimEntry {
    fn fully_claimed(&self) -> bool {
        self.participants.values().all(|p| p.claimed)
    }
}

struct State {
    jobs: HashMap<String, JobRecord>,
    queue: PriorityQueue<String, Reverse<i64>>,
    claims: HashMap<String, ClaimEntry>,
    ports: HashSet<u16>,
    /// Cancellations awaiting delivery, keyed by worker id
    cancels: HashMap<String, HashSet<String>>,
}

/// The control plane's scheduling core.
///
/// Placement decisions are serialized by the single state lock, so claim
/// arbitration outcomes are totally ordered.
pub struct Scheduler {
    config: SchedulerConfig,
    store: JobStore,
    workers: WorkerRegistry,
    state: RwLock<State>,
}

impl Scheduler {
    /// Build a scheduler, reconstructing queue and state from the store.
    ///
    /// Persisted claimed entries are stale by definition after a restart
    /// and revert to pending.
    pub fn new(config: SchedulerConfig, store: JobStore) -> Result<Self> {
        let mut jobs = store.load()?;
        let mut queue = PriorityQueue::new();

        for job in jobs.values_mut() {
            match job.status {
                JobStatus::Pending => {
                    queue.push(job.id.clone(), Reverse(job.queue_key()));
                }
                JobStatus::Claimed => {
                    job.requeue();
                    queue.push(job.id.clone(), Reverse(job.queue_key()));
                }
                _ => {}
            }
        }

        if !jobs.is_empty() {
            info!(jobs = jobs.len(), queued = queue.len(), "recovered job table");
        }
        store.save(&jobs)?;

        Ok(Self {
            workers: WorkerRegistry::new(config.heartbeat_timeout_secs),
            config,
            store,
            state: RwLock::new(State {
                jobs,
                queue,
                claims: HashMap::new(),
                ports: HashSet::new(),
                cancels: HashMap::new(),
            }),
        })
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn store_healthy(&self) -> bool {
        self.store.healthy()
    }

    // === Job lifecycle ===

    /// Accept a new job into the queue.
    pub fn submit(&self, config: JobConfig) -> Result<JobRecord> {
        let record = JobRecord::new(config);

        let mut state = self.state.write();
        state
            .queue
            .push(record.id.clone(), Reverse(record.queue_key()));
        state.jobs.insert(record.id.clone(), record.clone());
        self.persist(&state.jobs)?;

        info!(
            job_id = %record.id,
            project = %record.project,
            priority = ?record.priority,
            gpus = record.resources.gpus,
            "job submitted"
        );
        Ok(record)
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.state.read().jobs.get(job_id).cloned()
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.state.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    /// Append worker log lines to the job's bounded tail.
    pub fn append_logs(&self, job_id: &str, lines: Vec<LogLine>) -> Result<()> {
        let mut state = self.state.write();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        job.push_logs(lines);
        Ok(())
    }

    /// Apply a worker-reported status transition.
    ///
    /// Only the worker-driven edges of the lifecycle are accepted:
    /// claimed -> running and running -> {completed, failed, cancelled}.
    /// Re-posting the current status is a no-op (it may refresh progress);
    /// any other jump is rejected.
    pub fn update_status(&self, job_id: &str, update: StatusUpdate) -> Result<JobRecord> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        if job.status.is_terminal() {
            if update.status == job.status {
                return Ok(job.clone());
            }
            return Err(Error::TerminalState(job_id.to_string()));
        }

        if !is_legal_transition(job.status, update.status) {
            return Err(Error::InvalidTransition {
                job: job_id.to_string(),
                from: job.status,
                to: update.status,
            });
        }

        job.transition(update.status, update.message.as_deref());
        if update.status == JobStatus::Running {
            // The worker owns the job once it actually starts: the sole
            // claimant, or the rank-0 participant for distributed runs.
            let master = state.claims.get(job_id).and_then(|claim| {
                claim
                    .participants
                    .iter()
                    .find(|(_, p)| p.rank == 0)
                    .map(|(worker_id, _)| worker_id.clone())
            });
            if let Some(worker_id) = master {
                job.assigned_worker = Some(worker_id);
            }
        }
        if let Some(progress) = update.progress {
            job.progress = Some(progress);
        }

        let record = job.clone();
        if update.status.is_terminal() {
            finish_job(state, job_id);
        }
        self.persist(&state.jobs)?;

        info!(job_id, status = %update.status, "job status updated");
        Ok(record)
    }

    /// Client-requested cancellation.
    ///
    /// A pending job cancels immediately (no allocation was ever created);
    /// a claimed/running job is marked cancelled and the cancel flag is
    /// pushed to its worker(s) on their next heartbeat.
    pub fn cancel(&self, job_id: &str) -> Result<JobRecord> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        if job.status.is_terminal() {
            return Ok(job.clone());
        }

        let notify: Vec<String> = match state.claims.get(job_id) {
            Some(claim) => claim.participants.keys().cloned().collect(),
            None => job.assigned_worker.iter().cloned().collect(),
        };

        job.transition(JobStatus::Cancelled, Some("cancelled by user"));
        let record = job.clone();

        for worker_id in notify {
            state
                .cancels
                .entry(worker_id)
                .or_default()
                .insert(job_id.to_string());
        }
        finish_job(state, job_id);
        self.persist(&state.jobs)?;

        info!(job_id, "job cancelled");
        Ok(record)
    }

    // === Worker protocol ===

    /// Register (or re-register) a worker. Idempotent.
    pub fn register_worker(&self, req: &RegisterRequest) {
        self.workers
            .register(&req.worker_id, &req.platform, req.capabilities.clone());
    }

    /// Record a heartbeat and hand back any pending cancellations.
    pub fn heartbeat(&self, worker_id: &str, current_jobs: Vec<String>) -> Result<HeartbeatResponse> {
        if !self.workers.heartbeat(worker_id, current_jobs) {
            return Err(Error::WorkerNotFound(worker_id.to_string()));
        }

        let cancel_jobs = {
            let mut state = self.state.write();
            state
                .cancels
                .remove(worker_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default()
        };

        Ok(HeartbeatResponse {
            status: "ok".to_string(),
            cancel_jobs,
        })
    }

    /// Graceful worker shutdown: drop the record and reclaim its jobs.
    pub fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        self.workers
            .deregister(worker_id)
            .ok_or_else(|| Error::WorkerNotFound(worker_id.to_string()))?;
        self.reclaim_jobs_of(worker_id);
        Ok(())
    }

    /// The plain queue view, best first.
    pub fn pending_view(&self) -> Vec<PendingJob> {
        let state = self.state.read();
        state
            .queue
            .clone()
            .into_sorted_iter()
            .filter_map(|(job_id, _)| state.jobs.get(&job_id))
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| job.to_pending())
            .collect()
    }

    /// Offer work to a polling worker.
    ///
    /// Walks the queue in priority order and reserves the first job whose
    /// requirements the worker can satisfy now (first fit, not globally
    /// optimal). Distributed jobs are only assigned when enough distinct
    /// workers are simultaneously available; the whole group is reserved
    /// and every participant sees the job on its own poll.
    pub fn offer(&self, worker_id: &str) -> Vec<PendingJob> {
        let Some(worker) = self.workers.get(worker_id) else {
            return vec![];
        };

        let mut guard = self.state.write();
        let state = &mut *guard;
        expire_claims(state, &self.config);

        // Outstanding reservations for this worker come first.
        let outstanding: Vec<PendingJob> = state
            .claims
            .iter()
            .filter(|(_, claim)| {
                claim
                    .participants
                    .get(worker_id)
                    .is_some_and(|p| !p.claimed)
            })
            .filter_map(|(job_id, _)| state.jobs.get(job_id))
            .map(|job| job.to_pending())
            .collect();
        if !outstanding.is_empty() {
            return outstanding;
        }

        if worker.free_slots() == 0 {
            return vec![];
        }

        let ordered: Vec<String> = state
            .queue
            .clone()
            .into_sorted_iter()
            .map(|(job_id, _)| job_id)
            .collect();

        for job_id in ordered {
            let Some(job) = state.jobs.get(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Pending || state.claims.contains_key(&job_id) {
                continue;
            }
            if !worker_fits(&worker, &state.jobs, &job.resources) {
                continue;
            }

            let pending = job.to_pending();
            let expires_at = Utc::now() + Duration::seconds(self.config.claim_window_secs);

            if job.distributed {
                let world_size = job.world_size;
                let resources = job.resources.clone();

                let mut candidates: Vec<WorkerRecord> = self
                    .workers
                    .available_workers()
                    .into_iter()
                    .filter(|w| worker_fits(w, &state.jobs, &resources))
                    .collect();
                // The polling worker becomes rank 0; the rest in stable order.
                candidates.sort_by(|a, b| {
                    (a.id != worker_id)
                        .cmp(&(b.id != worker_id))
                        .then(a.id.cmp(&b.id))
                });

                if (candidates.len() as u32) < world_size {
                    continue;
                }

                let Some(port) = allocate_port(&mut state.ports, self.config.master_port_range)
                else {
                    warn!(job_id, "no free master port for distributed job");
                    continue;
                };

                let master_addr = candidates[0].capabilities.address.clone();
                let participants: HashMap<String, Participant> = candidates
                    .iter()
                    .take(world_size as usize)
                    .enumerate()
                    .map(|(rank, w)| {
                        (
                            w.id.clone(),
                            Participant {
                                rank: rank as u32,
                                claimed: false,
                            },
                        )
                    })
                    .collect();

                info!(
                    job_id,
                    world_size,
                    master_addr,
                    master_port = port,
                    "distributed assignment reserved"
                );
                state.claims.insert(
                    job_id.clone(),
                    ClaimEntry {
                        expires_at,
                        participants,
                        dist: Some(DistInfo {
                            world_size,
                            master_addr,
                            master_port: port,
                        }),
                    },
                );
            } else {
                state.claims.insert(
                    job_id.clone(),
                    ClaimEntry {
                        expires_at,
                        participants: HashMap::from([(
                            worker_id.to_string(),
                            Participant {
                                rank: 0,
                                claimed: false,
                            },
                        )]),
                        dist: None,
                    },
                );
            }

            return vec![pending];
        }

        vec![]
    }

    /// Arbitrate a claim. Exactly one worker wins; everyone else gets a
    /// benign conflict.
    pub fn claim(&self, job_id: &str, worker_id: &str) -> ClaimResponse {
        let mut guard = self.state.write();
        let state = &mut *guard;
        expire_claims(state, &self.config);

        let Some(job) = state.jobs.get_mut(job_id) else {
            return conflict("unknown job");
        };

        if job.status.is_terminal() || job.status == JobStatus::Running {
            return conflict(&format!("job is {}", job.status));
        }

        let response = match state.claims.get_mut(job_id) {
            Some(claim) => {
                let Some(participant) = claim.participants.get_mut(worker_id) else {
                    return conflict("claimed by another worker");
                };

                participant.claimed = true;
                let rank = participant.rank;
                let dist_config = claim.dist.as_ref().map(|d| DistConfig {
                    rank,
                    world_size: d.world_size,
                    master_addr: d.master_addr.clone(),
                    master_port: d.master_port,
                });

                if job.status == JobStatus::Pending {
                    job.transition(JobStatus::Claimed, None);
                }

                ClaimResponse {
                    success: true,
                    is_distributed: dist_config.is_some(),
                    dist_config,
                    message: None,
                }
            }
            None => {
                // First-come claim without a prior offer.
                if job.distributed {
                    return conflict("waiting for enough workers");
                }
                job.transition(JobStatus::Claimed, None);
                state.claims.insert(
                    job_id.to_string(),
                    ClaimEntry {
                        expires_at: Utc::now() + Duration::seconds(self.config.claim_window_secs),
                        participants: HashMap::from([(
                            worker_id.to_string(),
                            Participant {
                                rank: 0,
                                claimed: true,
                            },
                        )]),
                        dist: None,
                    },
                );
                ClaimResponse {
                    success: true,
                    is_distributed: false,
                    dist_config: None,
                    message: None,
                }
            }
        };

        state.queue.remove(job_id);
        if let Err(e) = self.persist(&state.jobs) {
            warn!(job_id, "failed to persist claim: {}", e);
        }
        info!(job_id, worker_id, "claim granted");
        response
    }

    // === Sweeps ===

    /// Periodic maintenance: expire stale claims and reclaim jobs from
    /// unreachable workers.
    pub fn tick(&self) {
        {
            let mut guard = self.state.write();
            expire_claims(&mut guard, &self.config);
        }

        for worker in self.workers.sweep_unreachable() {
            warn!(worker_id = %worker.id, "worker unreachable, reclaiming its jobs");
            self.reclaim_jobs_of(&worker.id);
        }
    }

    fn reclaim_jobs_of(&self, worker_id: &str) {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let affected: Vec<String> = state
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Claimed | JobStatus::Running))
            .filter(|j| {
                j.assigned_worker.as_deref() == Some(worker_id)
                    || state
                        .claims
                        .get(&j.id)
                        .is_some_and(|c| c.participants.contains_key(worker_id))
            })
            .map(|j| j.id.clone())
            .collect();

        for job_id in affected {
            // Surviving participants of a distributed run are told to stop.
            if let Some(claim) = state.claims.get(&job_id) {
                for participant in claim.participants.keys() {
                    if participant != worker_id {
                        state
                            .cancels
                            .entry(participant.clone())
                            .or_default()
                            .insert(job_id.clone());
                    }
                }
            }
            finish_job(state, &job_id);
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };

            job.attempts += 1;
            if job.attempts >= self.config.max_attempts {
                job.transition(
                    JobStatus::Failed,
                    Some(&format!(
                        "worker unreachable: gave up after {} attempts",
                        job.attempts
                    )),
                );
                info!(job_id, "job failed after repeated worker loss");
            } else {
                job.requeue();
                let key = job.queue_key();
                let attempts = job.attempts;
                state.queue.push(job_id.clone(), Reverse(key));
                info!(job_id, attempts, "job returned to pending");
            }
        }

        if let Err(e) = self.persist(&state.jobs) {
            warn!("failed to persist reclaim: {}", e);
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.read();
        let count = |s: JobStatus| state.jobs.values().filter(|j| j.status == s).count();
        SchedulerStatus {
            pending_jobs: count(JobStatus::Pending),
            claimed_jobs: count(JobStatus::Claimed),
            running_jobs: count(JobStatus::Running),
            completed_jobs: count(JobStatus::Completed),
            failed_jobs: count(JobStatus::Failed),
            cancelled_jobs: count(JobStatus::Cancelled),
            workers: self.workers.len(),
            available_workers: self.workers.available_workers().len(),
        }
    }

    fn persist(&self, jobs: &HashMap<String, JobRecord>) -> Result<()> {
        self.store.save(jobs)
    }
}

fn conflict(message: &str) -> ClaimResponse {
    ClaimResponse {
        success: false,
        is_distributed: false,
        dist_config: None,
        message: Some(message.to_string()),
    }
}

/// Worker-driven edges of the job lifecycle. Re-posting the current
/// status is allowed so workers can refresh the message and progress.
fn is_legal_transition(from: JobStatus, to: JobStatus) -> bool {
    match (from, to) {
        (JobStatus::Claimed, JobStatus::Running) => true,
        (JobStatus::Running, JobStatus::Completed)
        | (JobStatus::Running, JobStatus::Failed)
        | (JobStatus::Running, JobStatus::Cancelled) => true,
        (from, to) => from == to,
    }
}

/// Drop the claim entry and any resources tied to a finished job.
/// Queued cancel flags stay put: their delivery is how the owning worker
/// learns it should stop.
fn finish_job(state: &mut State, job_id: &str) {
    state.queue.remove(job_id);
    if let Some(claim) = state.claims.remove(job_id) {
        if let Some(dist) = claim.dist {
            state.ports.remove(&dist.master_port);
        }
    }
}

/// Revert claims whose window expired before every participant claimed.
/// A partially claimed distributed assignment rolls back as a whole.
fn expire_claims(state: &mut State, config: &SchedulerConfig) {
    let now = Utc::now();
    let expired: Vec<String> = state
        .claims
        .iter()
        .filter(|(_, claim)| now > claim.expires_at && !claim.fully_claimed())
        .map(|(job_id, _)| job_id.clone())
        .collect();

    for job_id in expired {
        let Some(claim) = state.claims.remove(&job_id) else {
            continue;
        };
        if let Some(dist) = claim.dist {
            state.ports.remove(&dist.master_port);
        }
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if matches!(job.status, JobStatus::Pending | JobStatus::Claimed) {
                job.requeue();
                let key = job.queue_key();
                state.queue.push(job_id.clone(), Reverse(key));
                info!(
                    job_id,
                    window_secs = config.claim_window_secs,
                    "claim window expired, job returned to pending"
                );
            }
        }
    }
}

fn worker_fits(
    worker: &WorkerRecord,
    jobs: &HashMap<String, JobRecord>,
    req: &ResourceRequest,
) -> bool {
    if worker.free_slots() == 0 {
        return false;
    }

    // Capacity already committed to this worker's running jobs.
    let mut gpus_in_use = 0u32;
    let mut cpus_in_use = 0u32;
    let mut memory_in_use = 0f64;
    for job in worker.running_jobs.iter().filter_map(|id| jobs.get(id)) {
        gpus_in_use += job.resources.gpus;
        cpus_in_use += job.resources.cpus;
        memory_in_use += job.resources.memory_gib;
    }

    if req.gpus > 0 {
        if !worker.has_real_gpus() {
            return false;
        }
        let free = worker.capabilities.gpu_count.saturating_sub(gpus_in_use);
        if free < req.gpus || worker.largest_gpu_mib() < req.memory_per_gpu_mib {
            return false;
        }
    }

    let free_cpus = worker.capabilities.cpu_count.saturating_sub(cpus_in_use);
    let free_memory = (worker.capabilities.memory_gib - memory_in_use).max(0.0);
    free_cpus >= req.cpus && free_memory >= req.memory_gib
}

fn allocate_port(ports: &mut HashSet<u16>, range: (u16, u16)) -> Option<u16> {
    (range.0..=range.1).find(|port| ports.insert(*port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use std::collections::HashMap as Map;
    use trainforge_proto::{GpuSummary, JobPriority, WorkerCapabilities};

    fn scheduler_in(dir: &std::path::Path, config: SchedulerConfig) -> Scheduler {
        let store = JobStore::new(StoreConfig {
            data_dir: dir.to_path_buf(),
            sync_writes: true,
        })
        .unwrap();
        Scheduler::new(config, store).unwrap()
    }

    fn scheduler() -> (tempfile::TempDir, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler_in(dir.path(), SchedulerConfig::default());
        (dir, s)
    }

    fn capabilities(gpus: u32, mock: bool) -> WorkerCapabilities {
        WorkerCapabilities {
            gpu_count: gpus,
            gpus: (0..gpus)
                .map(|i| GpuSummary {
                    index: i,
                    name: "NVIDIA RTX 4090".to_string(),
                    memory_mib: 16384,
                    mock,
                })
                .collect(),
            cpu_count: 16,
            memory_gib: 64.0,
            docker_available: false,
            max_concurrent_jobs: 4,
            address: "10.0.0.2".to_string(),
        }
    }

    fn register(s: &Scheduler, id: &str, gpus: u32) {
        s.register_worker(&RegisterRequest {
            worker_id: id.to_string(),
            platform: "local".to_string(),
            capabilities: capabilities(gpus, false),
        });
    }

    fn config(priority: JobPriority, gpus: u32, num_workers: u32) -> JobConfig {
        JobConfig {
            project: "mnist".to_string(),
            entrypoint: "train.py".to_string(),
            setup_command: None,
            resources: ResourceRequest {
                gpus,
                memory_per_gpu_mib: 8192,
                cpus: 2,
                memory_gib: 4.0,
            },
            priority,
            environment: Map::new(),
            image: None,
            num_workers,
        }
    }

    #[test]
    fn test_queue_orders_by_priority() {
        let (_dir, s) = scheduler();
        let low = s.submit(config(JobPriority::Low, 1, 1)).unwrap();
        let urgent = s.submit(config(JobPriority::Urgent, 1, 1)).unwrap();
        let normal = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();

        let view = s.pending_view();
        let ids: Vec<&str> = view.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec![&urgent.id, &normal.id, &low.id]);
    }

    #[test]
    fn test_offer_and_claim_happy_path() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();

        let offers = s.offer("w1");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].job_id, job.id);

        let resp = s.claim(&job.id, "w1");
        assert!(resp.success);
        assert!(!resp.is_distributed);

        // Claimed, but not yet running: no worker is assigned yet.
        let record = s.get(&job.id).unwrap();
        assert_eq!(record.status, JobStatus::Claimed);
        assert!(record.assigned_worker.is_none());
        assert!(s.pending_view().is_empty());

        let record = s
            .update_status(
                &job.id,
                StatusUpdate {
                    status: JobStatus::Running,
                    message: None,
                    progress: None,
                },
            )
            .unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.assigned_worker.as_deref(), Some("w1"));
    }

    #[test]
    fn test_claim_race_has_exactly_one_winner() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 2);
        register(&s, "w2", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();

        // Both workers race the claim without a prior offer.
        let first = s.claim(&job.id, "w1");
        let second = s.claim(&job.id, "w2");

        assert!(first.success);
        assert!(!second.success);

        // The winner's start ack assigns it the job.
        s.update_status(
            &job.id,
            StatusUpdate {
                status: JobStatus::Running,
                message: None,
                progress: None,
            },
        )
        .unwrap();
        let record = s.get(&job.id).unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.assigned_worker.as_deref(), Some("w1"));

        // The loser no longer sees the job as pending.
        assert!(s.offer("w2").is_empty());
    }

    #[test]
    fn test_offered_job_is_reserved_for_its_worker() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 2);
        register(&s, "w2", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();

        assert_eq!(s.offer("w1").len(), 1);
        let stolen = s.claim(&job.id, "w2");
        assert!(!stolen.success);

        assert!(s.claim(&job.id, "w1").success);
    }

    #[test]
    fn test_claim_of_terminal_job_is_a_conflict() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();
        s.cancel(&job.id).unwrap();

        let resp = s.claim(&job.id, "w1");
        assert!(!resp.success);
        assert_eq!(s.get(&job.id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn test_cancel_before_claim() {
        let (_dir, s) = scheduler();
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();

        let record = s.cancel(&job.id).unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.completed_at.is_some());
        assert!(record.assigned_worker.is_none());
        assert!(s.pending_view().is_empty());

        // Cancelling again is a no-op.
        assert_eq!(s.cancel(&job.id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn test_terminal_status_is_idempotent() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();
        s.claim(&job.id, "w1");

        let update = |status| StatusUpdate {
            status,
            message: None,
            progress: None,
        };
        s.update_status(&job.id, update(JobStatus::Running)).unwrap();
        s.update_status(&job.id, update(JobStatus::Completed)).unwrap();

        // Same terminal value: no-op.
        s.update_status(&job.id, update(JobStatus::Completed)).unwrap();
        // A different transition out of a terminal state is refused.
        assert!(matches!(
            s.update_status(&job.id, update(JobStatus::Failed)),
            Err(Error::TerminalState(_))
        ));

        let record = s.get(&job.id).unwrap();
        assert!(record.completed_at.is_some());
        assert!(record.started_at.unwrap() <= record.completed_at.unwrap());
    }

    #[test]
    fn test_illegal_status_jumps_are_rejected() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();

        let update = |status| StatusUpdate {
            status,
            message: None,
            progress: None,
        };

        // A never-claimed job cannot start or finish.
        assert!(matches!(
            s.update_status(&job.id, update(JobStatus::Running)),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            s.update_status(&job.id, update(JobStatus::Completed)),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(s.get(&job.id).unwrap().status, JobStatus::Pending);
        assert!(s.get(&job.id).unwrap().assigned_worker.is_none());

        // A claimed job cannot complete without running first.
        s.claim(&job.id, "w1");
        assert!(matches!(
            s.update_status(&job.id, update(JobStatus::Completed)),
            Err(Error::InvalidTransition { .. })
        ));

        // Re-posting the current status refreshes progress.
        s.update_status(&job.id, update(JobStatus::Running)).unwrap();
        s.update_status(
            &job.id,
            StatusUpdate {
                status: JobStatus::Running,
                message: Some("training".to_string()),
                progress: Some(40.0),
            },
        )
        .unwrap();
        assert_eq!(s.get(&job.id).unwrap().progress, Some(40.0));
    }

    #[test]
    fn test_offers_account_for_committed_cpu_and_memory() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 2); // 16 cores, 64 GiB

        let mut big = config(JobPriority::Normal, 0, 1);
        big.resources.cpus = 14;
        big.resources.memory_gib = 60.0;
        let running = s.submit(big).unwrap();
        s.claim(&running.id, "w1");
        s.update_status(
            &running.id,
            StatusUpdate {
                status: JobStatus::Running,
                message: None,
                progress: None,
            },
        )
        .unwrap();
        s.heartbeat("w1", vec![running.id.clone()]).unwrap();

        // 2 cores / 4 GiB remain; a 4-core job must not be offered.
        let mut oversized = config(JobPriority::Normal, 0, 1);
        oversized.resources.cpus = 4;
        let oversized = s.submit(oversized).unwrap();
        assert!(s.offer("w1").is_empty());

        // The default request (2 cores, 4 GiB) still fits exactly.
        s.cancel(&oversized.id).unwrap();
        let fits = s.submit(config(JobPriority::Normal, 0, 1)).unwrap();
        let offers = s.offer("w1");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].job_id, fits.id);
    }

    #[test]
    fn test_claim_window_expiry_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler_in(
            dir.path(),
            SchedulerConfig {
                claim_window_secs: 0,
                ..Default::default()
            },
        );
        register(&s, "w1", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();

        assert_eq!(s.offer("w1").len(), 1);
        std::thread::sleep(std::time::Duration::from_millis(10));
        s.tick();

        assert_eq!(s.get(&job.id).unwrap().status, JobStatus::Pending);
        assert_eq!(s.pending_view().len(), 1);
    }

    #[test]
    fn test_distributed_needs_enough_workers() {
        let (_dir, s) = scheduler();
        for i in 0..3 {
            register(&s, &format!("w{}", i), 1);
        }
        let job = s.submit(config(JobPriority::Normal, 1, 4)).unwrap();

        assert!(s.offer("w0").is_empty());
        assert_eq!(s.get(&job.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_distributed_rank_assignment() {
        let (_dir, s) = scheduler();
        for i in 0..4 {
            register(&s, &format!("w{}", i), 1);
        }
        let job = s.submit(config(JobPriority::Normal, 1, 4)).unwrap();

        // The fourth worker's poll completes the group.
        let offers = s.offer("w2");
        assert_eq!(offers.len(), 1);

        let mut ranks = vec![];
        let mut ports = std::collections::HashSet::new();
        for i in 0..4 {
            let resp = s.claim(&job.id, &format!("w{}", i));
            assert!(resp.success, "worker w{} claim failed", i);
            assert!(resp.is_distributed);
            let dist = resp.dist_config.unwrap();
            assert_eq!(dist.world_size, 4);
            assert_eq!(dist.master_addr, "10.0.0.2");
            ranks.push(dist.rank);
            ports.insert(dist.master_port);
        }

        // Distinct ranks 0..3, one shared port, rank 0 on the polling worker.
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert_eq!(ports.len(), 1);

        // Once the group starts, the rank-0 worker owns the job record.
        s.update_status(
            &job.id,
            StatusUpdate {
                status: JobStatus::Running,
                message: None,
                progress: None,
            },
        )
        .unwrap();
        assert_eq!(
            s.get(&job.id).unwrap().assigned_worker.as_deref(),
            Some("w2")
        );
    }

    #[test]
    fn test_distributed_partial_claim_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler_in(
            dir.path(),
            SchedulerConfig {
                claim_window_secs: 1,
                ..Default::default()
            },
        );
        for i in 0..2 {
            register(&s, &format!("w{}", i), 1);
        }
        let job = s.submit(config(JobPriority::Normal, 1, 2)).unwrap();

        assert_eq!(s.offer("w0").len(), 1);
        assert!(s.claim(&job.id, "w0").success);

        // w1 never claims; the window lapses and the whole group reverts.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        s.tick();

        let record = s.get(&job.id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.assigned_worker.is_none());
        assert_eq!(s.pending_view().len(), 1);
    }

    #[test]
    fn test_unreachable_worker_reclaim_and_attempt_cap() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler_in(
            dir.path(),
            SchedulerConfig {
                heartbeat_timeout_secs: 0,
                max_attempts: 2,
                ..Default::default()
            },
        );
        register(&s, "w1", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();
        s.claim(&job.id, "w1");
        s.update_status(
            &job.id,
            StatusUpdate {
                status: JobStatus::Running,
                message: None,
                progress: None,
            },
        )
        .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        s.tick();

        let record = s.get(&job.id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 1);

        // Second loss reaches the cap.
        register(&s, "w1", 2);
        s.claim(&job.id, "w1");
        std::thread::sleep(std::time::Duration::from_millis(10));
        s.tick();

        let record = s.get(&job.id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("unreachable"));
    }

    #[test]
    fn test_restart_recovers_queue_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = {
            let s = scheduler_in(dir.path(), SchedulerConfig::default());
            register(&s, "w1", 2);
            let a = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();
            let b = s.submit(config(JobPriority::High, 1, 1)).unwrap();
            s.claim(&a.id, "w1");
            (a, b)
        };

        // A restart reverts stale claims and rebuilds the queue.
        let s = scheduler_in(dir.path(), SchedulerConfig::default());
        let view = s.pending_view();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].job_id, b.id);
        assert_eq!(s.get(&a.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_mock_gpus_never_run_real_gpu_jobs() {
        let (_dir, s) = scheduler();
        s.register_worker(&RegisterRequest {
            worker_id: "mock-w".to_string(),
            platform: "local".to_string(),
            capabilities: capabilities(2, true),
        });

        s.submit(config(JobPriority::Normal, 1, 1)).unwrap();
        assert!(s.offer("mock-w").is_empty());

        // CPU-only jobs are still eligible.
        s.submit(config(JobPriority::Normal, 0, 1)).unwrap();
        assert_eq!(s.offer("mock-w").len(), 1);
    }

    #[test]
    fn test_heartbeat_delivers_cancellations() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 2);
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();
        s.claim(&job.id, "w1");
        s.update_status(
            &job.id,
            StatusUpdate {
                status: JobStatus::Running,
                message: None,
                progress: None,
            },
        )
        .unwrap();

        s.cancel(&job.id).unwrap();

        let resp = s.heartbeat("w1", vec![job.id.clone()]).unwrap();
        assert_eq!(resp.cancel_jobs, vec![job.id.clone()]);

        // Delivered once.
        let resp = s.heartbeat("w1", vec![]).unwrap();
        assert!(resp.cancel_jobs.is_empty());

        // Unknown workers must re-register.
        assert!(matches!(
            s.heartbeat("ghost", vec![]),
            Err(Error::WorkerNotFound(_))
        ));
    }

    #[test]
    fn test_memory_floor_respects_largest_device() {
        let (_dir, s) = scheduler();
        register(&s, "w1", 1); // 16384 MiB devices

        let mut big = config(JobPriority::Normal, 1, 1);
        big.resources.memory_per_gpu_mib = 32768;
        s.submit(big).unwrap();

        assert!(s.offer("w1").is_empty());
    }

    #[test]
    fn test_empty_log_batch_is_accepted() {
        let (_dir, s) = scheduler();
        let job = s.submit(config(JobPriority::Normal, 1, 1)).unwrap();
        s.append_logs(&job.id, vec![]).unwrap();
        assert!(s.get(&job.id).unwrap().log_tail.is_empty());
    }
}
