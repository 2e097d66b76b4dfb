//! # TrainForge Scheduler
//!
//! The control plane's scheduling core: authoritative job records, the
//! priority queue of pending work, the registry of known workers, claim
//! arbitration (including distributed rank assignment), and the durable
//! job store the queue is rebuilt from at startup.

pub mod job;
pub mod scheduler;
pub mod store;
pub mod workers;

pub use job::JobRecord;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStatus};
pub use store::{JobStore, StoreConfig};
pub use workers::{WorkerRecord, WorkerRegistry, WorkerStatus};

use trainforge_proto::JobStatus;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for scheduling operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown job id
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Unknown worker id
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// The job already reached a terminal state
    #[error("job {0} is in a terminal state")]
    TerminalState(String),

    /// The requested status change is not an edge of the job lifecycle
    #[error("job {job}: illegal transition {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// I/O error from the job store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
}
