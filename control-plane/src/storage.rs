//! Project and result archive storage
//!
//! Archives are opaque byte blobs keyed by job id, write-once per job.

use std::fs;
use std::io;
use std::path::PathBuf;

const PROJECT_ARCHIVE: &str = "project.zip";
const RESULTS_ARCHIVE: &str = "results.zip";

/// On-disk archive store under `<root>/<job_id>/`
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn job_dir(&self, job_id: &str) -> io::Result<PathBuf> {
        // Job ids are server-generated UUIDs; refuse anything else so a
        // crafted id can never escape the storage root.
        if job_id.is_empty()
            || !job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid job id: {}", job_id),
            ));
        }
        Ok(self.root.join(job_id))
    }

    fn save(&self, job_id: &str, file: &str, bytes: &[u8]) -> io::Result<()> {
        let dir = self.job_dir(job_id)?;
        fs::create_dir_all(&dir)?;
        let path = dir.join(file);
        if path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already stored for job {}", file, job_id),
            ));
        }
        fs::write(path, bytes)
    }

    fn read(&self, job_id: &str, file: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.job_dir(job_id)?.join(file);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(path).map(Some)
    }

    pub fn save_project(&self, job_id: &str, bytes: &[u8]) -> io::Result<()> {
        self.save(job_id, PROJECT_ARCHIVE, bytes)
    }

    pub fn read_project(&self, job_id: &str) -> io::Result<Option<Vec<u8>>> {
        self.read(job_id, PROJECT_ARCHIVE)
    }

    pub fn save_results(&self, job_id: &str, bytes: &[u8]) -> io::Result<()> {
        self.save(job_id, RESULTS_ARCHIVE, bytes)
    }

    pub fn read_results(&self, job_id: &str) -> io::Result<Option<Vec<u8>>> {
        self.read(job_id, RESULTS_ARCHIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_archive_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path().to_path_buf()).unwrap();

        store.save_project("job-1", b"zip bytes").unwrap();
        assert_eq!(store.read_project("job-1").unwrap().unwrap(), b"zip bytes");

        let err = store.save_project("job-1", b"other").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_missing_archive_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path().to_path_buf()).unwrap();

        assert!(store.read_project("job-1").unwrap().is_none());
        assert!(store.read_results("job-1").unwrap().is_none());
    }

    #[test]
    fn test_path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path().to_path_buf()).unwrap();

        assert!(store.save_project("../evil", b"x").is_err());
        assert!(store.read_project("a/b").is_err());
    }
}
