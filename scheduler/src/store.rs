//! Durable job store
//!
//! The scheduler rebuilds its queue from this table at startup. The store
//! is a JSON document per data directory; the control plane treats it as an
//! opaque document collection.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::job::JobRecord;
use crate::{Error, Result};

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Data directory; created on first use
    pub data_dir: PathBuf,
    /// Write through to disk on every save
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/control-plane"),
            sync_writes: true,
        }
    }
}

/// JSON-file backed job table
pub struct JobStore {
    config: StoreConfig,
}

impl JobStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        if !config.data_dir.exists() {
            fs::create_dir_all(&config.data_dir)?;
        }
        Ok(Self { config })
    }

    fn jobs_path(&self) -> PathBuf {
        self.config.data_dir.join("jobs.json")
    }

    /// Load the persisted job table; an absent file is an empty table.
    pub fn load(&self) -> Result<HashMap<String, JobRecord>> {
        let path = self.jobs_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Persist the whole job table.
    pub fn save(&self, jobs: &HashMap<String, JobRecord>) -> Result<()> {
        if !self.config.sync_writes {
            return Ok(());
        }

        let data =
            serde_json::to_string_pretty(jobs).map_err(|e| Error::Serialization(e.to_string()))?;

        // Write-then-rename so a crash never leaves a torn table.
        let tmp = self.config.data_dir.join("jobs.json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.jobs_path())?;
        Ok(())
    }

    /// Whether the backing directory is usable; reported by /health.
    pub fn healthy(&self) -> bool {
        self.config.data_dir.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainforge_proto::{JobConfig, JobStatus};

    fn job() -> JobRecord {
        JobRecord::new(JobConfig {
            project: "mnist".to_string(),
            entrypoint: "train.py".to_string(),
            setup_command: None,
            resources: Default::default(),
            priority: Default::default(),
            environment: Default::default(),
            image: None,
            num_workers: 1,
        })
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            sync_writes: true,
        })
        .unwrap();

        let mut jobs = HashMap::new();
        let mut record = job();
        record.transition(JobStatus::Running, None);
        jobs.insert(record.id.clone(), record.clone());
        store.save(&jobs).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        let restored = &loaded[&record.id];
        assert_eq!(restored.status, JobStatus::Running);
        assert_eq!(restored.project, "mnist");
    }

    #[test]
    fn test_load_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            sync_writes: true,
        })
        .unwrap();

        assert!(store.load().unwrap().is_empty());
        assert!(store.healthy());
    }

    #[test]
    fn test_sync_writes_disabled_skips_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            sync_writes: false,
        })
        .unwrap();

        let mut jobs = HashMap::new();
        let record = job();
        jobs.insert(record.id.clone(), record);
        store.save(&jobs).unwrap();

        assert!(store.load().unwrap().is_empty());
    }
}
