//! # TrainForge Protocol Types
//!
//! The wire contract between the control plane, the workers, and clients.
//! Everything here is plain serde data; no behavior beyond small helpers.

pub mod api;
pub mod job;

pub use api::{
    ClaimRequest, ClaimResponse, HealthResponse, HeartbeatRequest, HeartbeatResponse, LogBatch,
    LogLine, PendingJob, RegisterRequest, StatusUpdate, SubmitResponse, WorkerCapabilities,
    WorkerSummary,
};
pub use job::{DistConfig, GpuSummary, JobConfig, JobPriority, JobStatus, ResourceRequest};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
