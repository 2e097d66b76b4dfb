//! Subprocess backend, the fallback when no container runtime is available

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::handle::HandleKind;
use crate::{Error, JobHandle, LaunchSpec, Result, SupervisorConfig};

/// Spawn the training entrypoint directly on the host.
pub fn start(
    spec: &LaunchSpec,
    config: &SupervisorConfig,
    sink: mpsc::UnboundedSender<String>,
) -> Result<JobHandle> {
    let mut command = Command::new(&config.interpreter);
    command
        .arg(&spec.entrypoint)
        .current_dir(&spec.project_dir)
        .envs(spec.environment())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| Error::Spawn(format!("{} {}: {}", config.interpreter, spec.entrypoint, e)))?;

    let pid = child.id().map(|p| p as i32);
    info!(job_id = %spec.job_id, ?pid, "training subprocess started");

    // stdout and stderr are merged line-by-line into the same sink.
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, sink.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, sink);
    }

    let (tx, rx) = watch::channel(None);
    let job_id = spec.job_id.clone();
    tokio::spawn(async move {
        let code = match child.wait().await {
            // A signal-terminated process has no code; report -1.
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                debug!(job_id, "wait on training subprocess failed: {}", e);
                -1
            }
        };
        let _ = tx.send(Some(code));
    });

    Ok(JobHandle {
        job_id: spec.job_id.clone(),
        kind: HandleKind::Subprocess { pid },
        exit: rx,
    })
}

fn spawn_reader<R>(reader: R, sink: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if sink.send(line).is_err() {
                break;
            }
        }
    });
}
