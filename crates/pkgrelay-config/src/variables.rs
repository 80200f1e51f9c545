//! Parameter interpolation for job command templates.
//!
//! Supports variables like:
//! - `${component}` - Job / component name
//! - `${version}` - Declared version, verbatim (e.g. `v1.32.2`)
//! - `${package_type}` - `deb` or `rpm`
//! - `${runner}` - Runner reference, if any
//! - `${output_dir}` - Directory the build must write packages into
//! - `${work_dir}` - Job scratch directory
//! - `${run_id}` - Current run identifier
//! - `${<param>}` - Any `param` declared on the job
//! - `${env.VAR_NAME}` - Environment variable
//!
//! Unknown variables are left in place.

use pkgrelay_core::JobSpec;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_-]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Values available for interpolation into one job's command.
#[derive(Debug, Clone, Default)]
pub struct ParameterContext {
    values: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

impl ParameterContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for `job`. Job parameters are applied first, so the
    /// built-in names always refer to the job itself.
    pub fn for_job(job: &JobSpec) -> Self {
        let mut ctx = Self::new();
        for (key, value) in &job.parameters {
            ctx.set(key, value.clone());
        }
        ctx.set("component", job.name.clone());
        ctx.set("package_type", job.package_type.to_string());
        if let Some(version) = &job.declared_version {
            ctx.set("version", version.clone());
        }
        if let Some(runner) = &job.runner {
            ctx.set("runner", runner.clone());
        }
        ctx
    }

    pub fn with_dirs(mut self, work_dir: &Path, output_dir: &Path) -> Self {
        self.set("work_dir", work_dir.display().to_string());
        self.set("output_dir", output_dir.display().to_string());
        self
    }

    pub fn with_run_id(mut self, run_id: impl ToString) -> Self {
        self.set("run_id", run_id.to_string());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), value.into());
    }

    /// Resolved parameters (without environment entries).
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        match var_name.split_once('.') {
            Some(("env", name)) => self.env.get(name).cloned(),
            Some(_) => None,
            None => self.values.get(var_name).cloned(),
        }
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Names referenced in `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}
