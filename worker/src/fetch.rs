//! Project download, extraction, and setup

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::sync::mpsc;
use tracing::info;

use crate::client::ApiClient;

/// Download and extract the project archive into `<work_dir>/<job_id>/`.
///
/// The archive must contain the declared entrypoint at its root; anything
/// else is rejected before any process is started.
pub async fn fetch_project(
    client: &ApiClient,
    job_id: &str,
    work_dir: &Path,
    entrypoint: &str,
) -> Result<PathBuf> {
    let job_dir = work_dir.join(job_id);
    tokio::fs::create_dir_all(&job_dir)
        .await
        .with_context(|| format!("failed to create {}", job_dir.display()))?;

    let zip_path = job_dir.join("project.zip");
    client
        .download_project(job_id, &zip_path)
        .await
        .context("project archive unavailable")?;

    let extract_dir = job_dir.clone();
    let zip_for_blocking = zip_path.clone();
    tokio::task::spawn_blocking(move || extract_archive(&zip_for_blocking, &extract_dir))
        .await
        .context("extraction task failed")??;
    let _ = tokio::fs::remove_file(&zip_path).await;

    if !job_dir.join(entrypoint).exists() {
        bail!("project archive is missing the entrypoint {}", entrypoint);
    }

    info!(job_id, dir = %job_dir.display(), "project extracted");
    Ok(job_dir)
}

fn extract_archive(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_path)
        .with_context(|| format!("failed to open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("corrupt project archive")?;
    archive.extract(dest).context("failed to extract project archive")?;
    Ok(())
}

/// Run the declared setup command to completion, mirroring its output into
/// the job's log stream. A non-zero exit aborts the job before training
/// starts.
pub async fn run_setup(
    job_dir: &Path,
    command: &str,
    sink: &mpsc::UnboundedSender<String>,
) -> Result<()> {
    info!(command, "running setup command");
    let _ = sink.send(format!("$ {}", command));

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(job_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to run setup command: {}", command))?;

    for line in String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
    {
        let _ = sink.send(line.to_string());
    }

    if !output.status.success() {
        bail!("SetupFailed: exit {}", output.status.code().unwrap_or(-1));
    }
    Ok(())
}

/// Remove the scratch directory after the terminal report.
pub async fn cleanup_scratch(work_dir: &Path, job_id: &str) {
    let job_dir = work_dir.join(job_id);
    if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(job_id, "failed to clean scratch directory: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_archive(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("project.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_extract_archive() {
        let dir = tempfile::tempdir().unwrap();
        let zip = make_archive(dir.path(), &[("train.py", "print('hi')"), ("lib/util.py", "")]);

        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        extract_archive(&zip, &dest).unwrap();

        assert!(dest.join("train.py").exists());
        assert!(dest.join("lib/util.py").exists());
    }

    #[tokio::test]
    async fn test_setup_failure_carries_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = run_setup(dir.path(), "echo installing && exit 1", &tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SetupFailed: exit 1"));

        // The command line and its output were logged.
        assert_eq!(rx.recv().await.unwrap(), "$ echo installing && exit 1");
        assert_eq!(rx.recv().await.unwrap(), "installing");
    }

    #[tokio::test]
    async fn test_setup_success() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        run_setup(dir.path(), "true", &tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_scratch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("job-1");
        std::fs::create_dir_all(&job_dir).unwrap();

        cleanup_scratch(dir.path(), "job-1").await;
        assert!(!job_dir.exists());
        cleanup_scratch(dir.path(), "job-1").await;
    }
}
