//! Authoritative job record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use trainforge_proto::{
    JobConfig, JobPriority, JobStatus, LogLine, PendingJob, ResourceRequest,
};

/// Maximum retained log-tail lines; overflow drops the oldest
pub const LOG_TAIL_LIMIT: usize = 500;

/// One job as tracked by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub project: String,
    pub entrypoint: String,
    pub setup_command: Option<String>,
    pub resources: ResourceRequest,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub distributed: bool,
    pub world_size: u32,
    pub environment: HashMap<String, String>,
    pub image: Option<String>,
    pub error_message: Option<String>,
    /// Rank-0 worker for distributed jobs
    pub assigned_worker: Option<String>,
    pub progress: Option<f32>,
    /// Execution attempts, incremented on unreachable-worker reclaim
    pub attempts: u32,
    #[serde(default)]
    pub log_tail: VecDeque<LogLine>,
}

impl JobRecord {
    pub fn new(config: JobConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project: config.project,
            entrypoint: config.entrypoint,
            setup_command: config.setup_command,
            resources: config.resources,
            priority: config.priority,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            distributed: config.num_workers > 1,
            world_size: config.num_workers,
            environment: config.environment,
            image: config.image,
            error_message: None,
            assigned_worker: None,
            progress: None,
            attempts: 0,
            log_tail: VecDeque::new(),
        }
    }

    /// Apply a state transition, stamping timestamps.
    ///
    /// Returns false (and changes nothing) when the job is already terminal;
    /// re-applying the current terminal state is also a no-op.
    pub fn transition(&mut self, status: JobStatus, message: Option<&str>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.status = status;
        if let Some(message) = message {
            match status {
                JobStatus::Failed | JobStatus::Cancelled => {
                    self.error_message = Some(message.to_string());
                }
                _ => {}
            }
        }

        match status {
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        true
    }

    /// Return the job to the pending queue after a reclaim or claim timeout.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.assigned_worker = None;
        self.started_at = None;
        self.progress = None;
    }

    /// Append log lines, keeping only the newest [`LOG_TAIL_LIMIT`].
    pub fn push_logs(&mut self, lines: impl IntoIterator<Item = LogLine>) {
        for line in lines {
            if self.log_tail.len() == LOG_TAIL_LIMIT {
                self.log_tail.pop_front();
            }
            self.log_tail.push_back(line);
        }
    }

    /// Static queue key; lower runs first.
    ///
    /// The original score is `base(priority) - wait_hours + 10 * gpus`,
    /// which decays at the same rate for every queued job, so the ordering
    /// is captured once at submit time in units of seconds.
    pub fn queue_key(&self) -> i64 {
        self.priority.base_score() * 3600
            + self.submitted_at.timestamp()
            + i64::from(self.resources.gpus) * 36_000
    }

    pub fn to_pending(&self) -> PendingJob {
        PendingJob {
            job_id: self.id.clone(),
            project: self.project.clone(),
            entrypoint: self.entrypoint.clone(),
            setup_command: self.setup_command.clone(),
            resources: self.resources.clone(),
            priority: self.priority,
            environment: self.environment.clone(),
            image: self.image.clone(),
            distributed: self.distributed,
            world_size: self.world_size,
            submitted_at: self.submitted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(priority: JobPriority, gpus: u32) -> JobRecord {
        JobRecord::new(JobConfig {
            project: "mnist".to_string(),
            entrypoint: "train.py".to_string(),
            setup_command: None,
            resources: ResourceRequest {
                gpus,
                ..Default::default()
            },
            priority,
            environment: HashMap::new(),
            image: None,
            num_workers: 1,
        })
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let mut job = record(JobPriority::Normal, 1);
        assert!(job.started_at.is_none());

        assert!(job.transition(JobStatus::Running, None));
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        assert!(job.transition(JobStatus::Completed, None));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_never_transition_again() {
        let mut job = record(JobPriority::Normal, 1);
        job.transition(JobStatus::Failed, Some("exit 1"));

        assert!(!job.transition(JobStatus::Running, None));
        assert!(!job.transition(JobStatus::Completed, None));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("exit 1"));
    }

    #[test]
    fn test_queue_key_ordering() {
        let urgent = record(JobPriority::Urgent, 1);
        let normal = record(JobPriority::Normal, 1);
        let low = record(JobPriority::Low, 1);

        assert!(urgent.queue_key() < normal.queue_key());
        assert!(normal.queue_key() < low.queue_key());
    }

    #[test]
    fn test_smaller_jobs_win_ties() {
        let small = record(JobPriority::Normal, 1);
        let big = record(JobPriority::Normal, 4);

        assert!(small.queue_key() < big.queue_key());
    }

    #[test]
    fn test_log_tail_is_bounded() {
        let mut job = record(JobPriority::Normal, 1);
        job.push_logs((0..LOG_TAIL_LIMIT + 20).map(|i| LogLine::new(format!("line {}", i))));

        assert_eq!(job.log_tail.len(), LOG_TAIL_LIMIT);
        assert_eq!(job.log_tail.front().unwrap().message, "line 20");
    }
}
