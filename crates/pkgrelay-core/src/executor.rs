//! Build executor capability.
//!
//! The orchestration core does not know how a component is compiled. An
//! executor receives the resolved command and an output directory and
//! either succeeds (having written zero or more package files there) or
//! fails.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{AbortSignal, Result, RunId};

/// Everything an executor needs to run one build job.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRequest {
    pub run_id: RunId,
    pub job_name: String,
    /// Fully interpolated command.
    pub command: String,
    /// Resolved parameters, also exposed to the build as environment.
    pub parameters: BTreeMap<String, String>,
    /// Container image or runner reference, if the job names one.
    pub runner: Option<String>,
    /// Isolated scratch directory for this job.
    pub work_dir: PathBuf,
    /// Directory the build must write its packages into.
    pub output_dir: PathBuf,
    #[serde(skip)]
    pub abort: AbortSignal,
}

impl BuildRequest {
    /// Parameters as `PKGRELAY_<KEY>` environment variables.
    pub fn env(&self) -> Vec<(String, String)> {
        self.parameters
            .iter()
            .map(|(k, v)| {
                let key = k
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect::<String>();
                (format!("PKGRELAY_{key}"), v.clone())
            })
            .collect()
    }
}

/// Trait for build executors.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run the build to completion.
    ///
    /// Returns `Err(Error::ExecutionFailed)` on a non-zero exit and
    /// `Err(Error::Cancelled)` when the request's abort signal fires.
    async fn execute(&self, request: BuildRequest) -> Result<()>;
}
