//! Project configuration parsing.

use crate::system::{ExecutorConfig, RegistryConfig, RepositoryConfig, RetryConfig, RunConfig};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use pkgrelay_core::{JobSpec, PackageType};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything read from a `pkgrelay.kdl` file.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    pub run: RunConfig,
    pub executor: ExecutorConfig,
    pub repository: RepositoryConfig,
    pub registry: Option<RegistryConfig>,
    /// The job table, one row per component, in declaration order.
    pub jobs: Vec<JobSpec>,
}

/// Read and parse a configuration file.
pub fn load_config(path: &Path) -> ConfigResult<ProjectConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse a project configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<ProjectConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = ProjectConfig::default();
    let mut names = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "run" => config.run = parse_run(node)?,
            "executor" => config.executor = parse_executor(node)?,
            "repository" => config.repository = parse_repository(node)?,
            "registry" => config.registry = Some(parse_registry(node)?),
            "job" => {
                let job = parse_job(node)?;
                if !names.insert(job.name.clone()) {
                    return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
                }
                config.jobs.push(job);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if config.jobs.is_empty() {
        return Err(ConfigError::MissingField("at least one job".to_string()));
    }

    Ok(config)
}

fn parse_run(node: &KdlNode) -> ConfigResult<RunConfig> {
    let defaults = RunConfig::default();

    let workers = get_u64_prop(node, "workers")?.map(|w| w as usize);
    if workers == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "run workers".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    Ok(RunConfig {
        workers,
        barrier_timeout: get_secs_prop(node, "barrier-timeout")?
            .unwrap_or(defaults.barrier_timeout),
        run_timeout: get_secs_prop(node, "run-timeout")?,
        job_timeout: get_secs_prop(node, "job-timeout")?,
        work_dir: get_string_prop(node, "work-dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir),
    })
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorConfig> {
    let kind = get_first_string_arg(node).unwrap_or_else(|| "shell".to_string());
    match kind.as_str() {
        "shell" => Ok(ExecutorConfig::Shell),
        "docker" => Ok(ExecutorConfig::Docker {
            image: get_string_prop(node, "image"),
        }),
        other => Err(ConfigError::InvalidValue {
            field: "executor".to_string(),
            message: format!("unknown executor type: {}", other),
        }),
    }
}

fn parse_repository(node: &KdlNode) -> ConfigResult<RepositoryConfig> {
    let defaults = RepositoryConfig::default();
    let architectures = get_string_list_prop(node, "architectures");

    Ok(RepositoryConfig {
        distribution: get_string_prop(node, "distribution").unwrap_or(defaults.distribution),
        component: get_string_prop(node, "component").unwrap_or(defaults.component),
        architectures: if architectures.is_empty() {
            defaults.architectures
        } else {
            architectures
        },
    })
}

fn parse_registry(node: &KdlNode) -> ConfigResult<RegistryConfig> {
    let url = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("registry url".to_string()))?;
    let owner = get_string_prop(node, "owner")
        .ok_or_else(|| ConfigError::MissingField("registry owner".to_string()))?;

    let mut registry = RegistryConfig::new(url, owner);
    if let Some(token) = get_string_prop(node, "token") {
        registry.token_secret = token;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "concurrency" => {
                    let value = get_first_u64_arg(child)?.ok_or_else(|| {
                        ConfigError::MissingField("registry concurrency".to_string())
                    })?;
                    if value == 0 {
                        return Err(ConfigError::InvalidValue {
                            field: "registry concurrency".to_string(),
                            message: "must be at least 1".to_string(),
                        });
                    }
                    registry.concurrency = value as usize;
                }
                "retry" => registry.retry = parse_retry(child)?,
                _ => {}
            }
        }
    }

    Ok(registry)
}

fn parse_retry(node: &KdlNode) -> ConfigResult<RetryConfig> {
    let defaults = RetryConfig::default();

    let max_attempts = get_u64_prop(node, "attempts")?
        .map(|a| a as u32)
        .unwrap_or(defaults.max_attempts);
    if max_attempts == 0 {
        return Err(ConfigError::InvalidValue {
            field: "retry attempts".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    let multiplier = match node.get("multiplier") {
        Some(v) => v
            .as_float()
            .or_else(|| v.as_integer().map(|i| i as f64))
            .filter(|m| *m >= 1.0)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "retry multiplier".to_string(),
                message: "expected a number >= 1".to_string(),
            })?,
        None => defaults.multiplier,
    };

    Ok(RetryConfig {
        max_attempts,
        initial_delay: get_u64_prop(node, "initial-ms")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_delay),
        max_delay: get_u64_prop(node, "max-ms")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay),
        multiplier,
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let package_type = match get_string_prop(node, "type") {
        Some(t) => t
            .parse::<PackageType>()
            .map_err(|e| ConfigError::InvalidValue {
                field: format!("type of job '{}'", name),
                message: e.to_string(),
            })?,
        None => {
            return Err(ConfigError::MissingField(format!(
                "type for job '{}'",
                name
            )));
        }
    };

    let mut commands = Vec::new();
    let mut job = JobSpec::new(name.clone(), package_type, String::new());
    job.declared_version = get_string_prop(node, "version");
    job.runner = get_string_prop(node, "runner");

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "command" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "param" => {
                    let args = get_all_string_args(child);
                    match args.as_slice() {
                        [key, value] => {
                            job.parameters.insert(key.clone(), value.clone());
                        }
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                field: format!("param of job '{}'", name),
                                message: "expected a key and a value".to_string(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "command for job '{}'",
            name
        )));
    }
    job.command_template = commands.join(" && ");

    Ok(job)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_u64_arg(node: &KdlNode) -> ConfigResult<Option<u64>> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| integer_to_u64(node.name().value(), e.value().as_integer()))
        .transpose()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    node.get(name)
        .map(|v| integer_to_u64(name, v.as_integer()))
        .transpose()
}

fn get_secs_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    Ok(get_u64_prop(node, name)?.map(Duration::from_secs))
}

fn integer_to_u64(field: &str, value: Option<i128>) -> ConfigResult<u64> {
    value
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected a non-negative integer".to_string(),
        })
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
