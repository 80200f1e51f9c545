//! Full build-and-publish run.

use anyhow::{Context, Result};
use pkgrelay_config::{ExecutorConfig, RegistryConfig};
use pkgrelay_core::executor::BuildExecutor;
use pkgrelay_core::registry::RegistryClient;
use pkgrelay_core::secret::EnvSecretProvider;
use pkgrelay_core::{AbortReason, BuildStatus, PublishStatus};
use pkgrelay_executor::{DockerExecutor, ShellExecutor};
use pkgrelay_publisher::{HttpRegistryClient, MemoryRegistry};
use pkgrelay_repo::SystemTooling;
use pkgrelay_scheduler::{PublishState, RunEvent, RunOrchestrator, RunSummary};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(config_path: &Path, work_dir: Option<PathBuf>, dry_run: bool, json: bool) -> Result<()> {
    let (mut config, plan) = super::load(config_path)?;
    if let Some(work_dir) = work_dir {
        config.run.work_dir = work_dir;
    }

    let executor: Arc<dyn BuildExecutor> = match &config.executor {
        ExecutorConfig::Shell => Arc::new(ShellExecutor::new()),
        ExecutorConfig::Docker { image } => {
            Arc::new(DockerExecutor::new(image.clone()).context("Failed to connect to Docker")?)
        }
    };

    let mut orchestrator = RunOrchestrator::new(executor, Arc::new(SystemTooling::new()), &config);
    match registry(config.registry.as_ref(), dry_run).await? {
        Some((client, registry_config)) => {
            orchestrator = orchestrator.with_registry(client, registry_config);
        }
        None => warn!("No registry configured, artifacts will not be uploaded"),
    }

    let abort = orchestrator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting run");
            abort.abort(AbortReason::External);
        }
    });

    let (mut rx, handle) = orchestrator.execute(&plan);
    while let Some(event) = rx.recv().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }

    let summary = handle.await.context("Run task failed")?;
    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        print_summary(&summary);
    }

    summary.into_result().context("Run failed")?;
    Ok(())
}

/// The registry client for this run, if any.
async fn registry(
    config: Option<&RegistryConfig>,
    dry_run: bool,
) -> Result<Option<(Arc<dyn RegistryClient>, RegistryConfig)>> {
    if dry_run {
        info!("Dry run, uploads are recorded in memory");
        let config = config
            .cloned()
            .unwrap_or_else(|| RegistryConfig::new("memory://", "dry-run"));
        return Ok(Some((Arc::new(MemoryRegistry::new()), config)));
    }

    let Some(config) = config else {
        return Ok(None);
    };
    let client = HttpRegistryClient::from_config(config, &EnvSecretProvider::new())
        .await
        .with_context(|| format!("Failed to set up registry client for {}", config.url))?;
    Ok(Some((Arc::new(client), config.clone())))
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::JobStarted { job } => println!("▶ {} started", job),
        RunEvent::JobFinished { job, status } => match status {
            BuildStatus::Succeeded => println!("✓ {} succeeded", job),
            BuildStatus::Failed { message } => println!("✗ {} failed: {}", job, message),
            other => println!("  {} {:?}", job, other),
        },
        RunEvent::PublishBlocked { failed } => {
            println!("⊘ publish blocked by: {}", failed.join(", "))
        }
        RunEvent::PublishStarted => println!("▶ publish started"),
        RunEvent::ArtifactExcluded { file, reason } => {
            println!("  excluded {}: {}", file, reason)
        }
        RunEvent::IndexGenerated {
            package_type,
            package_count,
        } => println!("✓ {} index: {} package(s)", package_type, package_count),
        RunEvent::IndexFailed {
            package_type,
            error,
        } => println!("✗ {} index failed: {}", package_type, error),
        RunEvent::Published { record } => {
            let marker = match record.status {
                PublishStatus::Published => "↑",
                PublishStatus::Skipped => "=",
                PublishStatus::Failed => "✗",
            };
            match &record.message {
                Some(message) => println!("{} {} ({})", marker, record.remote_url, message),
                None => println!("{} {}", marker, record.remote_url),
            }
        }
        RunEvent::RunCompleted { success } => {
            if *success {
                println!("--- Run completed successfully ---");
            } else {
                println!("--- Run failed ---");
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\n--- Run {} ---", summary.run_id);
    println!("  directory: {}", summary.run_dir.display());
    println!(
        "  builds: {} succeeded, {} failed",
        summary.succeeded(),
        summary.failed()
    );
    println!(
        "  artifacts: {} collected, {} excluded",
        summary.artifacts.len(),
        summary.excluded.len()
    );
    println!(
        "  uploads: {} published, {} skipped, {} failed",
        summary.published(),
        summary.count(PublishStatus::Skipped),
        summary.count(PublishStatus::Failed)
    );
    let publish = match &summary.publish {
        PublishState::Succeeded => "succeeded".to_string(),
        PublishState::Blocked { failed } => format!("blocked by {}", failed.join(", ")),
        PublishState::Failed { reason } => format!("failed: {}", reason),
        PublishState::Aborted { reason } => format!("aborted: {}", reason),
        PublishState::Waiting => "waiting".to_string(),
        PublishState::Running => "running".to_string(),
    };
    println!("  publish: {}", publish);
}
