//! Repository metadata generation.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use pkgrelay_config::RepositoryConfig;
use pkgrelay_core::artifact::sha256_bytes;
use pkgrelay_core::{Artifact, PackageType};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::tooling::IndexTooling;
use crate::{RepoError, RepoResult, deb, rpm};

/// Output of one generation for one package type.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryIndex {
    pub package_type: PackageType,
    pub root_path: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub package_count: usize,
    /// Generated index files, relative to `root_path`, sorted.
    pub index_files: Vec<PathBuf>,
    /// SHA-256 over the index files' paths and contents.
    pub digest: String,
}

/// Builds apt-style and yum-style repository trees.
pub struct MetadataGenerator {
    tooling: Arc<dyn IndexTooling>,
    repository: RepositoryConfig,
}

impl MetadataGenerator {
    pub fn new(tooling: Arc<dyn IndexTooling>, repository: RepositoryConfig) -> Self {
        Self {
            tooling,
            repository,
        }
    }

    /// Regenerate the `package_type` repository under `output_root` from
    /// the artifacts of that type. Previous metadata is removed first.
    pub async fn generate(
        &self,
        artifacts: &[Artifact],
        package_type: PackageType,
        output_root: &Path,
    ) -> RepoResult<RepositoryIndex> {
        let mut selected: Vec<&Artifact> = artifacts
            .iter()
            .filter(|a| a.package_type == package_type)
            .collect();
        selected.sort_by_key(|a| a.file_name());

        info!(
            package_type = %package_type,
            root = %output_root.display(),
            packages = selected.len(),
            "Generating repository metadata"
        );

        tokio::fs::create_dir_all(output_root).await?;
        let tooling = self.tooling.as_ref();
        let index_files = match package_type {
            PackageType::Deb => deb::generate(tooling, &self.repository, &selected, output_root).await?,
            PackageType::Rpm => rpm::generate(tooling, &selected, output_root).await?,
        };

        let digest = index_digest(output_root, &index_files).await?;
        Ok(RepositoryIndex {
            package_type,
            root_path: output_root.to_path_buf(),
            generated_at: Utc::now(),
            package_count: selected.len(),
            index_files,
            digest,
        })
    }

    /// Generate every package type concurrently. A failure for one type
    /// does not affect the others.
    pub async fn generate_all(
        &self,
        artifacts: &[Artifact],
        roots: &BTreeMap<PackageType, PathBuf>,
    ) -> BTreeMap<PackageType, RepoResult<RepositoryIndex>> {
        let runs = roots.iter().map(|(package_type, root)| async move {
            let result = self.generate(artifacts, *package_type, root).await;
            if let Err(e) = &result {
                warn!(package_type = %package_type, error = %e, "Metadata generation failed");
            }
            (*package_type, result)
        });
        join_all(runs).await.into_iter().collect()
    }
}

async fn index_digest(root: &Path, files: &[PathBuf]) -> RepoResult<String> {
    let mut hasher = Sha256::new();
    for file in files {
        let content = tokio::fs::read(root.join(file)).await?;
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(&content);
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Size and checksums of a file, as listed in index files.
#[derive(Debug, Clone)]
pub(crate) struct FileDigest {
    pub md5: String,
    pub sha256: String,
    pub size: u64,
}

impl FileDigest {
    pub fn of(data: &[u8]) -> Self {
        Self {
            md5: format!("{:x}", md5::compute(data)),
            sha256: sha256_bytes(data),
            size: data.len() as u64,
        }
    }
}

/// Remove `dir` with everything in it and create it empty.
pub(crate) async fn reset_dir(dir: &Path) -> RepoResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Control fields from the tooling. A package the tooling cannot read is
/// indexed from its file name alone.
pub(crate) async fn control_fields(
    tooling: &dyn IndexTooling,
    package_type: PackageType,
    path: &Path,
) -> RepoResult<BTreeMap<String, String>> {
    match tooling.control_fields(package_type, path).await {
        Ok(fields) => Ok(fields),
        Err(RepoError::InvalidPackage { file, message }) => {
            warn!(file = %file, %message, "Indexing from file name only");
            Ok(BTreeMap::new())
        }
        Err(e) => Err(e),
    }
}
