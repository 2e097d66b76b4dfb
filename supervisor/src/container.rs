//! Container backend: docker CLI with GPU device passthrough

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::handle::HandleKind;
use crate::{Error, JobHandle, LaunchSpec, Result, SupervisorConfig};

/// Fixed mount point for the project directory inside the container
const WORKSPACE_MOUNT: &str = "/workspace";

/// Probe for a usable docker daemon.
pub async fn docker_available() -> bool {
    match Command::new("docker")
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

pub(crate) fn container_name(job_id: &str) -> String {
    format!("trainforge-{}", job_id)
}

/// Start a detached training container and attach log/exit watchers.
pub async fn start(
    spec: &LaunchSpec,
    config: &SupervisorConfig,
    sink: mpsc::UnboundedSender<String>,
) -> Result<JobHandle> {
    let name = container_name(&spec.job_id);
    let image = spec.image.as_deref().unwrap_or(&config.default_image);
    let project_dir = spec
        .project_dir
        .canonicalize()
        .map_err(|e| Error::Spawn(format!("project directory unavailable: {}", e)))?;

    let mut command = Command::new("docker");
    command
        .args(["run", "-d", "--name", &name])
        .arg("-v")
        .arg(format!("{}:{}", project_dir.display(), WORKSPACE_MOUNT))
        .args(["-w", WORKSPACE_MOUNT]);

    if !spec.gpu_indices.is_empty() {
        let devices = spec
            .gpu_indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        command.arg("--gpus").arg(format!("\"device={}\"", devices));
    }

    for (key, value) in spec.environment() {
        command.arg("-e").arg(format!("{}={}", key, value));
    }
    // The container runtime uses its own device visibility variable.
    if !spec.gpu_indices.is_empty() {
        let devices = spec
            .gpu_indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        command
            .arg("-e")
            .arg(format!("NVIDIA_VISIBLE_DEVICES={}", devices));
    }

    command.arg(image).arg(&config.interpreter).arg(&spec.entrypoint);

    let output = command
        .output()
        .await
        .map_err(|e| Error::Spawn(format!("docker run: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Spawn(format!(
            "docker run failed for {}: {}",
            name,
            stderr.trim()
        )));
    }

    info!(job_id = %spec.job_id, container = %name, image, "training container started");

    spawn_log_reader(&name, sink);
    let exit = spawn_exit_watcher(&name);

    Ok(JobHandle {
        job_id: spec.job_id.clone(),
        kind: HandleKind::Container { name },
        exit,
    })
}

fn spawn_log_reader(name: &str, sink: mpsc::UnboundedSender<String>) {
    let name = name.to_string();
    tokio::spawn(async move {
        let child = Command::new("docker")
            .args(["logs", "-f", &name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(container = %name, "failed to attach log reader: {}", e);
                return;
            }
        };

        // docker logs keeps the stdout/stderr split; merge both streams.
        let mut tasks = vec![];
        if let Some(stdout) = child.stdout.take() {
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if sink.send(line).is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if sink.send(line).is_err() {
                        break;
                    }
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
        let _ = child.wait().await;
    });
}

fn spawn_exit_watcher(name: &str) -> watch::Receiver<Option<i32>> {
    let (tx, rx) = watch::channel(None);
    let name = name.to_string();
    tokio::spawn(async move {
        let code = match Command::new("docker").args(["wait", &name]).output().await {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse::<i32>()
                .unwrap_or(-1),
            Ok(output) => {
                debug!(container = %name, "docker wait failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim());
                -1
            }
            Err(e) => {
                debug!(container = %name, "docker wait error: {}", e);
                -1
            }
        };
        let _ = tx.send(Some(code));
    });
    rx
}

/// Stop a container, allowing `grace` before the runtime kills it.
pub async fn stop(name: &str, grace: Duration) -> Result<()> {
    let status = Command::new("docker")
        .args(["stop", "-t", &grace.as_secs().to_string(), name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| Error::Container(format!("docker stop {}: {}", name, e)))?;

    if !status.success() {
        warn!(container = %name, "docker stop reported failure");
    }
    Ok(())
}

/// Force-remove a container; missing containers are not an error.
pub async fn remove(name: &str) -> Result<()> {
    let status = Command::new("docker")
        .args(["rm", "-f", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| Error::Container(format!("docker rm {}: {}", name, e)))?;

    if status.success() {
        debug!(container = %name, "container removed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_scheme() {
        assert_eq!(container_name("abc-123"), "trainforge-abc-123");
    }
}
