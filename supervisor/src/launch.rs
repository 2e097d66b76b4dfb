//! Launch specification and environment contract

use std::collections::BTreeMap;
use std::path::PathBuf;

use trainforge_proto::DistConfig;

/// Everything needed to launch one training process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub job_id: String,
    /// Extracted project directory; becomes the working directory
    pub project_dir: PathBuf,
    /// Entrypoint path relative to the project root
    pub entrypoint: String,
    /// Allocated GPU indices, exposed via the visible-devices mask
    pub gpu_indices: Vec<u32>,
    /// Rendezvous coordinates for distributed jobs
    pub dist: Option<DistConfig>,
    /// Free-form environment from the job config
    pub extra_env: BTreeMap<String, String>,
    /// Container image override
    pub image: Option<String>,
}

impl LaunchSpec {
    pub fn world_size(&self) -> u32 {
        self.dist.as_ref().map(|d| d.world_size).unwrap_or(1)
    }

    /// The environment injected into the training process.
    ///
    /// Job-config entries are applied first; the reserved keys always win.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.extra_env.clone();

        let mask = self
            .gpu_indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");

        env.insert("TRAINFORGE_JOB_ID".to_string(), self.job_id.clone());
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), mask);
        env.insert("WORLD_SIZE".to_string(), self.world_size().to_string());
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        if let Some(dist) = &self.dist {
            env.insert("RANK".to_string(), dist.rank.to_string());
            env.insert("MASTER_ADDR".to_string(), dist.master_addr.clone());
            env.insert("MASTER_PORT".to_string(), dist.master_port.to_string());
        }

        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            job_id: "job-1".to_string(),
            project_dir: PathBuf::from("/tmp/job-1"),
            entrypoint: "train.py".to_string(),
            gpu_indices: vec![0],
            dist: None,
            extra_env: BTreeMap::new(),
            image: None,
        }
    }

    #[test]
    fn test_single_gpu_environment() {
        let env = spec().environment();

        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").unwrap(), "0");
        assert_eq!(env.get("WORLD_SIZE").unwrap(), "1");
        assert_eq!(env.get("TRAINFORGE_JOB_ID").unwrap(), "job-1");
        assert_eq!(env.get("PYTHONUNBUFFERED").unwrap(), "1");
        assert!(!env.contains_key("RANK"));
        assert!(!env.contains_key("MASTER_ADDR"));
    }

    #[test]
    fn test_distributed_environment() {
        let mut s = spec();
        s.gpu_indices = vec![1, 3];
        s.dist = Some(DistConfig {
            rank: 2,
            world_size: 4,
            master_addr: "10.0.0.5".to_string(),
            master_port: 29517,
        });

        let env = s.environment();
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").unwrap(), "1,3");
        assert_eq!(env.get("WORLD_SIZE").unwrap(), "4");
        assert_eq!(env.get("RANK").unwrap(), "2");
        assert_eq!(env.get("MASTER_ADDR").unwrap(), "10.0.0.5");
        assert_eq!(env.get("MASTER_PORT").unwrap(), "29517");
    }

    #[test]
    fn test_reserved_keys_win_over_job_env() {
        let mut s = spec();
        s.extra_env
            .insert("CUDA_VISIBLE_DEVICES".to_string(), "7".to_string());
        s.extra_env.insert("NCCL_DEBUG".to_string(), "INFO".to_string());

        let env = s.environment();
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").unwrap(), "0");
        assert_eq!(env.get("NCCL_DEBUG").unwrap(), "INFO");
    }

    #[test]
    fn test_cpu_only_mask_is_empty() {
        let mut s = spec();
        s.gpu_indices = vec![];
        assert_eq!(s.environment().get("CUDA_VISIBLE_DEVICES").unwrap(), "");
    }
}
