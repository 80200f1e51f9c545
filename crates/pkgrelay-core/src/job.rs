//! Job specifications and build results.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Packaging format a job produces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    #[display("deb")]
    Deb,
    #[display("rpm")]
    Rpm,
}

impl PackageType {
    pub const ALL: [PackageType; 2] = [PackageType::Deb, PackageType::Rpm];

    /// File extension (without the dot) of packages of this type.
    pub fn extension(&self) -> &'static str {
        match self {
            PackageType::Deb => "deb",
            PackageType::Rpm => "rpm",
        }
    }

    /// Classify a file by its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Self::ALL
            .into_iter()
            .find(|t| t.extension().eq_ignore_ascii_case(ext))
    }
}

impl std::str::FromStr for PackageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deb" => Ok(PackageType::Deb),
            "rpm" => Ok(PackageType::Rpm),
            other => Err(Error::InvalidInput(format!("unknown package type: {other}"))),
        }
    }
}

/// Static description of one component build. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job (and component) name.
    pub name: String,
    /// Command with `${...}` placeholders, resolved per run.
    pub command_template: String,
    /// Extra parameters substituted into the command.
    pub parameters: BTreeMap<String, String>,
    /// Version declared by the job, e.g. `v1.32.2`.
    pub declared_version: Option<String>,
    /// Package type the job is expected to produce.
    pub package_type: PackageType,
    /// Opaque reference to the container image or runner to use.
    pub runner: Option<String>,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        package_type: PackageType,
        command_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command_template: command_template.into(),
            parameters: BTreeMap::new(),
            declared_version: None,
            package_type,
            runner: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.declared_version = Some(version.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = Some(runner.into());
        self
    }
}

/// `name` with every character outside `[A-Za-z0-9._-]` replaced by `-`,
/// usable as a directory or container name.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Status of a single build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Succeeded)
    }

    fn rank(&self) -> u8 {
        match self {
            BuildStatus::Pending => 0,
            BuildStatus::Running => 1,
            BuildStatus::Succeeded | BuildStatus::Failed { .. } => 2,
        }
    }
}

/// Outcome record of one build job within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub job_name: String,
    pub status: BuildStatus,
    /// Package files found in the output directory, sorted by name.
    pub artifact_paths: Vec<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildResult {
    pub fn pending(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            status: BuildStatus::Pending,
            artifact_paths: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`. Status only ever moves forward and a terminal
    /// status is final.
    pub fn transition(&mut self, next: BuildStatus) -> Result<()> {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return Err(Error::InvalidTransition(format!(
                "job '{}': {:?} -> {:?}",
                self.job_name, self.status, next
            )));
        }

        let now = Utc::now();
        match next {
            BuildStatus::Running => self.started_at = Some(now),
            BuildStatus::Succeeded | BuildStatus::Failed { .. } => self.finished_at = Some(now),
            BuildStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn succeed(&mut self, artifact_paths: Vec<PathBuf>) -> Result<()> {
        self.transition(BuildStatus::Succeeded)?;
        self.artifact_paths = artifact_paths;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(BuildStatus::Failed {
            message: message.into(),
        })
    }
}
