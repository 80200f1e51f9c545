//! Run, executor, repository and registry settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Scheduling limits for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum concurrent build jobs. `None` means one worker per job.
    pub workers: Option<usize>,
    /// How long the publish job waits for all builds to finish.
    pub barrier_timeout: Duration,
    /// Upper bound on the whole run.
    pub run_timeout: Option<Duration>,
    /// Upper bound on a single build job.
    pub job_timeout: Option<Duration>,
    /// Root under which each run gets its own directory.
    pub work_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: None,
            barrier_timeout: Duration::from_secs(3600),
            run_timeout: None,
            job_timeout: None,
            work_dir: PathBuf::from("build"),
        }
    }
}

impl RunConfig {
    /// Worker capacity for `job_count` jobs.
    pub fn worker_capacity(&self, job_count: usize) -> usize {
        self.workers.unwrap_or(job_count).max(1)
    }
}

/// Which build executor backend to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorConfig {
    /// Run commands with the local shell.
    #[default]
    Shell,
    /// Run commands in containers. `image` is used for jobs that do not
    /// name a runner.
    Docker { image: Option<String> },
}

/// Layout of the generated package repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// apt distribution (suite), e.g. "stable".
    pub distribution: String,
    /// apt component, e.g. "main".
    pub component: String,
    /// Architectures that always get an index, even when empty.
    pub architectures: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            distribution: "stable".to_string(),
            component: "main".to_string(),
            architectures: vec!["amd64".to_string()],
        }
    }
}

/// Bounded exponential backoff for uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Remote registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the registry.
    pub url: String,
    /// Organization that owns the packages.
    pub owner: String,
    /// Name of the secret holding the bearer token.
    pub token_secret: String,
    /// Maximum concurrent uploads.
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl RegistryConfig {
    pub fn new(url: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            owner: owner.into(),
            token_secret: "PKGRELAY_TOKEN".to_string(),
            concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}
