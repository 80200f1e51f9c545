//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result, bail};
use pkgrelay_config::{ParameterContext, ProjectConfig, RepositoryConfig, load_config};
use pkgrelay_core::artifact::sha256_file;
use pkgrelay_core::{Artifact, PackageType};
use pkgrelay_repo::{MetadataGenerator, SystemTooling, resolve_version};
use pkgrelay_scheduler::{PUBLISH_JOB, RunPlan};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) fn load(path: &Path) -> Result<(ProjectConfig, RunPlan)> {
    let config = load_config(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))?;
    let plan = RunPlan::from_config(&config)
        .with_context(|| format!("Invalid job table in {}", path.display()))?;
    Ok((config, plan))
}

pub fn validate(path: &Path) -> Result<()> {
    let (config, plan) = load(path)?;
    println!("Configuration is valid");
    println!("  jobs: {}", plan.jobs.len());
    println!("  executor: {:?}", config.executor);
    match &config.registry {
        Some(registry) => println!("  registry: {} (owner {})", registry.url, registry.owner),
        None => println!("  registry: none"),
    }
    Ok(())
}

pub fn plan(path: &Path) -> Result<()> {
    let (config, plan) = load(path)?;
    let run_dir = config.run.work_dir.join("<run-id>");

    println!(
        "{} job(s), {} worker(s), barrier timeout {}s",
        plan.jobs.len(),
        config.run.worker_capacity(plan.jobs.len()),
        config.run.barrier_timeout.as_secs()
    );
    for job in plan.jobs.jobs() {
        let job_dir = run_dir.join("jobs").join(&job.name);
        let params = ParameterContext::for_job(job)
            .with_dirs(&job_dir.join("work"), &job_dir.join("out"))
            .with_run_id("<run-id>");

        println!("\n{} ({})", job.name, job.package_type);
        if let Some(version) = &job.declared_version {
            println!("  version: {}", version);
        }
        if let Some(runner) = &job.runner {
            println!("  runner: {}", runner);
        }
        println!("  command: {}", params.interpolate(&job.command_template));
        let unresolved = params.unresolved(&job.command_template);
        if !unresolved.is_empty() {
            println!("  unresolved: {}", unresolved.join(", "));
        }
    }

    println!("\n{} waits for:", PUBLISH_JOB);
    for edge in plan.graph.edges() {
        println!("  {} -> {}", edge.from, edge.to);
    }
    Ok(())
}

pub fn resolve(file: &str, declared: Option<&str>) -> Result<()> {
    let resolved = resolve_version(file, declared)?;
    println!("{} ({:?})", resolved.version, resolved.source);
    Ok(())
}

/// Index loose package files, using the repository settings of the
/// configuration file when it exists.
pub async fn index(
    config_path: &Path,
    package_type: PackageType,
    root: &Path,
    declared: Option<&str>,
    files: &[PathBuf],
) -> Result<()> {
    let repository = if config_path.exists() {
        load_config(config_path)
            .with_context(|| format!("Failed to load config file: {}", config_path.display()))?
            .repository
    } else {
        RepositoryConfig::default()
    };

    ensure_outside_root(root, files)?;

    let mut artifacts = Vec::with_capacity(files.len());
    for path in files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Not a file: {}", path.display()))?;
        let version = resolve_version(&file_name, declared)?.version;
        artifacts.push(Artifact {
            component_name: component_of(&file_name, &version),
            package_type: PackageType::from_path(path).unwrap_or(package_type),
            checksum: sha256_file(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            file_path: path.clone(),
            resolved_version: version,
        });
    }

    let generator = MetadataGenerator::new(Arc::new(SystemTooling::new()), repository);
    let index = generator.generate(&artifacts, package_type, root).await?;

    println!(
        "Indexed {} package(s) into {}",
        index.package_count,
        index.root_path.display()
    );
    for file in &index.index_files {
        println!("  {}", file.display());
    }
    println!("digest: {}", index.digest);
    Ok(())
}

/// Generating a repository resets its pool, so input files must not live
/// under `root`.
fn ensure_outside_root(root: &Path, files: &[PathBuf]) -> Result<()> {
    let Ok(root) = root.canonicalize() else {
        return Ok(());
    };
    for path in files {
        let file = path
            .canonicalize()
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if file.starts_with(&root) {
            bail!(
                "{} is inside the repository root {}",
                path.display(),
                root.display()
            );
        }
    }
    Ok(())
}

/// Component name of a loose package file: the file name up to its version.
fn component_of(file_name: &str, version: &str) -> String {
    let prefix = file_name
        .find(version)
        .map(|i| &file_name[..i])
        .unwrap_or(file_name);
    let name = prefix
        .strip_suffix('v')
        .filter(|p| p.ends_with(['-', '_']))
        .unwrap_or(prefix)
        .trim_end_matches(['-', '_']);
    if name.is_empty() {
        file_name.split(['_', '.']).next().unwrap_or(file_name).to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_under_root_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let pool = root.join("pool/main");
        std::fs::create_dir_all(&pool).unwrap();
        let inside = pool.join("kubelet_1.32.2_amd64.deb");
        let outside = dir.path().join("kubeadm_1.32.2_amd64.deb");
        std::fs::write(&inside, "deb").unwrap();
        std::fs::write(&outside, "deb").unwrap();

        assert!(ensure_outside_root(&root, std::slice::from_ref(&outside)).is_ok());
        let err = ensure_outside_root(&root, &[outside.clone(), inside]).unwrap_err();
        assert!(err.to_string().contains("inside the repository root"));

        let relative = root.join("pool/../pool/main/kubelet_1.32.2_amd64.deb");
        assert!(ensure_outside_root(&root, &[relative]).is_err());
    }

    #[test]
    fn test_missing_root_accepts_existing_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("kubelet_1.32.2_amd64.deb");
        std::fs::write(&file, "deb").unwrap();
        assert!(ensure_outside_root(&dir.path().join("new-repo"), &[file]).is_ok());
    }

    #[test]
    fn test_component_of() {
        assert_eq!(component_of("kubelet_1.32.2_amd64.deb", "1.32.2"), "kubelet");
        assert_eq!(component_of("cri-tools-1.32.0-0.x86_64.rpm", "1.32.0"), "cri-tools");
        assert_eq!(component_of("helm-v3.17.1-linux.deb", "3.17.1"), "helm");
        assert_eq!(component_of("kv_1.0.0_all.deb", "1.0.0"), "kv");
        assert_eq!(component_of("bundle.deb", "2025.01"), "bundle");
    }
}
