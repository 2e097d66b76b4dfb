//! Result collection and archiving
//!
//! After a successful run the worker gathers artifacts by convention:
//! well-known model/metric extensions at the project root plus everything
//! under a `results/` subtree, zipped into a single upload.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level extensions collected as results
pub const RESULT_EXTENSIONS: &[&str] = &["pth", "pt", "h5", "pkl", "json"];

/// Subtree collected wholesale
pub const RESULTS_SUBTREE: &str = "results";

const ARCHIVE_NAME: &str = "results.zip";

/// Find result files under a finished job directory.
pub fn collect_result_files(job_dir: &Path) -> Vec<PathBuf> {
    let mut files = vec![];

    if let Ok(entries) = std::fs::read_dir(job_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.file_name().is_some_and(|n| n == ARCHIVE_NAME) {
                continue;
            }
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| RESULT_EXTENSIONS.contains(&e));
            if matches {
                files.push(path);
            }
        }
    }

    collect_tree(&job_dir.join(RESULTS_SUBTREE), &mut files);
    files.sort();
    files
}

fn collect_tree(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tree(&path, files);
        } else if path.is_file() {
            files.push(path);
        }
    }
}

/// Build `results.zip` in the job directory.
///
/// Returns `None` when there is nothing to upload.
pub fn build_results_archive(job_dir: &Path) -> Result<Option<PathBuf>> {
    let files = collect_result_files(job_dir);
    if files.is_empty() {
        return Ok(None);
    }

    let archive_path = job_dir.join(ARCHIVE_NAME);
    let file = std::fs::File::create(&archive_path)
        .with_context(|| format!("failed to create {}", archive_path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for path in &files {
        let name = path
            .strip_prefix(job_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("failed to add {} to archive", name))?;
        let mut source = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut buffer = Vec::new();
        source.read_to_end(&mut buffer)?;
        writer.write_all(&buffer)?;
    }

    writer.finish().context("failed to finalize results archive")?;
    info!(
        files = files.len(),
        archive = %archive_path.display(),
        "results archived"
    );
    Ok(Some(archive_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_collects_by_extension_and_subtree() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("model.pth"), "weights");
        touch(&dir.path().join("metrics.json"), "{}");
        touch(&dir.path().join("train.py"), "code");
        touch(&dir.path().join("results/plots/loss.png"), "png");

        let files = collect_result_files(dir.path());
        let names: Vec<String> = files
            .iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .to_string()
            })
            .collect();

        assert!(names.contains(&"model.pth".to_string()));
        assert!(names.contains(&"metrics.json".to_string()));
        assert!(names.contains(&"results/plots/loss.png".to_string()));
        assert!(!names.iter().any(|n| n == "train.py"));
    }

    #[test]
    fn test_no_results_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("train.py"), "code");

        assert!(build_results_archive(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_archive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("best_model.pt"), "weights");
        touch(&dir.path().join("results/summary.txt"), "ok");

        let archive = build_results_archive(dir.path()).unwrap().unwrap();
        let mut zip = zip::ZipArchive::new(std::fs::File::open(&archive).unwrap()).unwrap();

        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["best_model.pt", "results/summary.txt"]);
    }

    #[test]
    fn test_existing_archive_is_not_recollected() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("model.pth"), "weights");
        touch(&dir.path().join("results.zip"), "stale");

        let files = collect_result_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("model.pth"));
    }
}
