//! The publish job: collect artifacts, generate repository metadata and
//! upload everything to the registry.

use pkgrelay_core::artifact::sha256_file;
use pkgrelay_core::{Artifact, BuildResult, PackageType, PublishRecord, PublishStatus};
use pkgrelay_publisher::{PublishItem, Publisher};
use pkgrelay_repo::{MetadataGenerator, RepositoryIndex, resolve_version};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::orchestrator::{RunContext, RunEvent};

/// A package file left out of the repository.
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedArtifact {
    pub job: String,
    pub file: String,
    pub reason: String,
}

/// Metadata generation result for one package type.
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub package_type: PackageType,
    pub index: Option<RepositoryIndex>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct PublishOutcome {
    pub artifacts: Vec<Artifact>,
    pub excluded: Vec<ExcludedArtifact>,
    pub indexes: Vec<IndexOutcome>,
    pub records: Vec<PublishRecord>,
    pub halted: Option<String>,
    pub errors: Vec<String>,
}

impl PublishOutcome {
    /// Why the publish job failed, if it did.
    pub fn failure(&self) -> Option<String> {
        if let Some(halted) = &self.halted {
            return Some(format!("publishing halted: {halted}"));
        }
        let failed = self
            .records
            .iter()
            .filter(|r| r.status == PublishStatus::Failed)
            .count();
        let mut reasons = self.errors.clone();
        if failed > 0 {
            reasons.push(format!("{failed} upload(s) failed"));
        }
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }
}

pub(crate) async fn run(ctx: &RunContext, jobs: &[BuildResult]) -> PublishOutcome {
    let mut outcome = PublishOutcome::default();
    let collected_dir = ctx.run_dir.join("collected");

    if let Err(e) = tokio::fs::create_dir_all(&collected_dir).await {
        outcome
            .errors
            .push(format!("cannot create {}: {e}", collected_dir.display()));
        return outcome;
    }

    collect(ctx, jobs, &collected_dir, &mut outcome).await;
    info!(
        artifacts = outcome.artifacts.len(),
        excluded = outcome.excluded.len(),
        "Collected artifacts"
    );

    let indexes = generate_indexes(ctx, &outcome.artifacts).await;
    for (package_type, result) in indexes {
        match result {
            Ok(index) => {
                ctx.emit(RunEvent::IndexGenerated {
                    package_type,
                    package_count: index.package_count,
                })
                .await;
                outcome.indexes.push(IndexOutcome {
                    package_type,
                    index: Some(index),
                    error: None,
                });
            }
            Err(e) => {
                let message = e.to_string();
                ctx.emit(RunEvent::IndexFailed {
                    package_type,
                    error: message.clone(),
                })
                .await;
                outcome
                    .errors
                    .push(format!("{package_type} metadata: {message}"));
                outcome.indexes.push(IndexOutcome {
                    package_type,
                    index: None,
                    error: Some(message),
                });
            }
        }
    }

    let Some((client, config)) = &ctx.registry else {
        info!("No registry configured, skipping upload");
        return outcome;
    };

    let publisher = Publisher::new(client.clone(), config).with_abort(ctx.abort.signal());
    let packages: Vec<PublishItem> = outcome.artifacts.iter().map(PublishItem::from_artifact).collect();
    let report = publisher.publish_all(&packages).await;
    record(ctx, &mut outcome, report.records).await;

    if report.halted.is_none() && !ctx.abort.is_aborted() {
        let mut items = Vec::new();
        for index in outcome.indexes.iter().filter_map(|i| i.index.as_ref()) {
            for relative in &index.index_files {
                match PublishItem::index_file(index.package_type, &index.digest, &index.root_path, relative) {
                    Ok(item) => items.push(item),
                    Err(e) => outcome
                        .errors
                        .push(format!("index file {}: {e}", relative.display())),
                }
            }
        }
        let report = publisher.publish_all(&items).await;
        record(ctx, &mut outcome, report.records).await;
    }

    outcome.halted = publisher.halted().map(str::to_string);
    if let Some(reason) = &outcome.halted {
        error!(reason = %reason, "Publishing halted");
    }
    outcome
}

async fn record(ctx: &RunContext, outcome: &mut PublishOutcome, records: Vec<PublishRecord>) {
    for record in records {
        ctx.emit(RunEvent::Published {
            record: record.clone(),
        })
        .await;
        outcome.records.push(record);
    }
}

/// Copy every package of every build into `collected_dir`, resolve its
/// version and checksum it.
async fn collect(
    ctx: &RunContext,
    jobs: &[BuildResult],
    collected_dir: &Path,
    outcome: &mut PublishOutcome,
) {
    let mut seen = BTreeSet::new();

    for result in jobs {
        let declared = ctx
            .jobs
            .get(&result.job_name)
            .and_then(|job| job.declared_version.as_deref());

        for path in &result.artifact_paths {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(package_type) = PackageType::from_path(path) else {
                continue;
            };

            if !seen.insert(file.clone()) {
                exclude(ctx, outcome, &result.job_name, &file, "duplicate file name".to_string()).await;
                continue;
            }

            let version = match resolve_version(&file, declared) {
                Ok(resolved) => resolved.version,
                Err(e) => {
                    exclude(ctx, outcome, &result.job_name, &file, e.to_string()).await;
                    continue;
                }
            };

            let dest = collected_dir.join(&file);
            match copy_and_hash(path, &dest).await {
                Ok(checksum) => outcome.artifacts.push(Artifact {
                    component_name: result.job_name.clone(),
                    package_type,
                    file_path: dest,
                    resolved_version: version,
                    checksum,
                }),
                Err(e) => exclude(ctx, outcome, &result.job_name, &file, e).await,
            }
        }
    }
}

async fn exclude(
    ctx: &RunContext,
    outcome: &mut PublishOutcome,
    job: &str,
    file: &str,
    reason: String,
) {
    warn!(job = %job, file = %file, reason = %reason, "Excluding artifact");
    ctx.emit(RunEvent::ArtifactExcluded {
        file: file.to_string(),
        reason: reason.clone(),
    })
    .await;
    outcome.excluded.push(ExcludedArtifact {
        job: job.to_string(),
        file: file.to_string(),
        reason,
    });
}

async fn copy_and_hash(src: &Path, dest: &Path) -> Result<String, String> {
    tokio::fs::copy(src, dest)
        .await
        .map_err(|e| format!("copy failed: {e}"))?;
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file(&dest))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
}

/// One repository per package type the jobs declare or the artifacts have.
async fn generate_indexes(
    ctx: &RunContext,
    artifacts: &[Artifact],
) -> BTreeMap<PackageType, pkgrelay_repo::RepoResult<RepositoryIndex>> {
    let roots: BTreeMap<PackageType, PathBuf> = ctx
        .package_types
        .iter()
        .copied()
        .chain(artifacts.iter().map(|a| a.package_type))
        .map(|t| (t, ctx.run_dir.join("repo").join(t.to_string())))
        .collect();

    MetadataGenerator::new(ctx.tooling.clone(), ctx.repository.clone())
        .generate_all(artifacts, &roots)
        .await
}
