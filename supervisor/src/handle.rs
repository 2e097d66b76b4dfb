//! Opaque handle to a running training process

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{container, Result};

/// Backend-specific part of a handle
#[derive(Debug, Clone)]
pub(crate) enum HandleKind {
    Container { name: String },
    Subprocess { pid: Option<i32> },
}

/// Handle to one supervised training process.
///
/// Exactly one handle exists per running job on a host. Cleanup must be
/// attempted on every exit path, including cancellation.
pub struct JobHandle {
    pub(crate) job_id: String,
    pub(crate) kind: HandleKind,
    pub(crate) exit: watch::Receiver<Option<i32>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Exit code if the process has terminated.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Wait for the process to terminate and return its exit code.
    ///
    /// A process killed by a signal reports -1; non-zero codes are passed
    /// through without reinterpretation.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return -1;
            }
        }
    }

    /// Stop the process: graceful signal first, forced kill after `grace`.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }

        match &self.kind {
            HandleKind::Container { name } => {
                container::stop(name, grace).await?;
            }
            HandleKind::Subprocess { pid } => {
                let Some(pid) = *pid else {
                    return Ok(());
                };
                signal_process(pid, nix::sys::signal::Signal::SIGTERM);

                if tokio::time::timeout(grace, self.wait()).await.is_err() {
                    warn!(job_id = %self.job_id, "grace period expired, sending SIGKILL");
                    signal_process(pid, nix::sys::signal::Signal::SIGKILL);
                    self.wait().await;
                }
            }
        }

        debug!(job_id = %self.job_id, "training process stopped");
        Ok(())
    }

    /// Remove backend leftovers (the container, if any).
    ///
    /// Scratch directory removal belongs to the worker runtime.
    pub async fn cleanup(&self) -> Result<()> {
        match &self.kind {
            HandleKind::Container { name } => container::remove(name).await,
            HandleKind::Subprocess { .. } => Ok(()),
        }
    }
}

fn signal_process(pid: i32, signal: nix::sys::signal::Signal) {
    if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        // ESRCH means the process already exited between the check and the
        // signal, which is fine.
        if e != nix::errno::Errno::ESRCH {
            warn!(pid, %signal, "failed to signal process: {}", e);
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("kind", &self.kind)
            .field("exit_code", &self.exit_code())
            .finish()
    }
}
