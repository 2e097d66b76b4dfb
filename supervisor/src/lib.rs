//! # TrainForge Supervisor
//!
//! Executes a prepared project directory as a training process with the
//! right device visibility, streams its merged output to a caller-supplied
//! sink, and reports termination.
//!
//! Two backends exist: a container backend (docker CLI) used when a runtime
//! is present, and a subprocess fallback. The backend is chosen once by a
//! capability probe at startup; both inject the same environment contract.

pub mod container;
pub mod handle;
pub mod launch;
pub mod subprocess;

use tokio::sync::mpsc;
use tracing::info;

pub use handle::JobHandle;
pub use launch::LaunchSpec;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for process supervision
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The training process could not be started
    #[error("failed to start training process: {0}")]
    Spawn(String),

    /// Container runtime operation failed
    #[error("container runtime error: {0}")]
    Container(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Execution backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Docker container with device passthrough
    Container,
    /// Plain subprocess with environment injection
    Subprocess,
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Image used when the job config does not declare one
    pub default_image: String,
    /// Interpreter for the training entrypoint
    pub interpreter: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_image: "pytorch/pytorch:latest".to_string(),
            interpreter: "python3".to_string(),
        }
    }
}

/// Launches training processes on one host.
pub struct Supervisor {
    backend: BackendKind,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Probe for a container runtime and pick the backend.
    pub async fn detect(config: SupervisorConfig) -> Self {
        let backend = if container::docker_available().await {
            BackendKind::Container
        } else {
            BackendKind::Subprocess
        };
        info!(?backend, "supervisor backend selected");
        Self { backend, config }
    }

    /// Force a specific backend.
    pub fn with_backend(backend: BackendKind, config: SupervisorConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn docker_available(&self) -> bool {
        self.backend == BackendKind::Container
    }

    /// Start a training process.
    ///
    /// Every merged stdout/stderr line is delivered to `sink` on the reader
    /// task; the sink must not block (it is expected to enqueue into a batch
    /// uploader).
    pub async fn start(
        &self,
        spec: &LaunchSpec,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<JobHandle> {
        match self.backend {
            BackendKind::Container => container::start(spec, &self.config, sink).await,
            BackendKind::Subprocess => subprocess::start(spec, &self.config, sink),
        }
    }
}
