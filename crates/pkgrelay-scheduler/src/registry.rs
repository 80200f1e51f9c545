//! The job table.

use pkgrelay_config::ProjectConfig;
use pkgrelay_core::JobSpec;
use std::collections::HashMap;

use crate::graph::PUBLISH_JOB;
use crate::{SchedulerError, SchedulerResult};

/// Build jobs of a run, in declaration order. Read-only once built.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Vec<JobSpec>,
    index: HashMap<String, usize>,
}

impl JobRegistry {
    pub fn new(jobs: Vec<JobSpec>) -> SchedulerResult<Self> {
        if jobs.is_empty() {
            return Err(SchedulerError::NoJobs);
        }

        let mut index = HashMap::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            if job.name == PUBLISH_JOB || index.insert(job.name.clone(), i).is_some() {
                return Err(SchedulerError::DuplicateJob(job.name.clone()));
            }
        }
        Ok(Self { jobs, index })
    }

    pub fn from_config(config: &ProjectConfig) -> SchedulerResult<Self> {
        Self::new(config.jobs.clone())
    }

    pub fn get(&self, name: &str) -> Option<&JobSpec> {
        self.index.get(name).map(|&i| &self.jobs[i])
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|j| j.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
