//! APT repository layout.
//!
//! ```text
//! <root>/pool/<component>/<file>.deb
//! <root>/dists/<dist>/<component>/binary-<arch>/Packages
//! <root>/dists/<dist>/<component>/binary-<arch>/Packages.gz
//! <root>/dists/<dist>/Release
//! ```

use pkgrelay_config::RepositoryConfig;
use pkgrelay_core::{Artifact, PackageType};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{RepoError, RepoResult};
use crate::generator::{FileDigest, control_fields, reset_dir};
use crate::tooling::IndexTooling;

/// Fields written by the generator rather than taken from the package.
const GENERATED_FIELDS: [&str; 6] = ["Filename", "Size", "MD5sum", "SHA1", "SHA256", "Description"];

const ARCH_ALL: &str = "all";

#[derive(Debug, Clone)]
struct Stanza {
    package: String,
    version: String,
    architecture: String,
    fields: BTreeMap<String, String>,
    filename: String,
    digest: FileDigest,
}

impl Stanza {
    fn sort_key(&self) -> (&str, &str, &str) {
        (&self.package, &self.version, &self.architecture)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Package: {}", self.package);
        let _ = writeln!(out, "Version: {}", self.version);
        let _ = writeln!(out, "Architecture: {}", self.architecture);
        for (key, value) in &self.fields {
            if matches!(key.as_str(), "Package" | "Version" | "Architecture")
                || GENERATED_FIELDS.contains(&key.as_str())
            {
                continue;
            }
            let _ = writeln!(out, "{}: {}", key, value);
        }
        let _ = writeln!(out, "Filename: {}", self.filename);
        let _ = writeln!(out, "Size: {}", self.digest.size);
        let _ = writeln!(out, "MD5sum: {}", self.digest.md5);
        let _ = writeln!(out, "SHA256: {}", self.digest.sha256);
        if let Some(description) = self.fields.get("Description") {
            let _ = writeln!(out, "Description: {}", description);
        }
        out
    }
}

/// `name_version_arch.deb` split into its parts.
fn parse_file_name(file_name: &str) -> Option<(String, String, String)> {
    let stem = file_name.strip_suffix(".deb")?;
    let mut parts = stem.split('_');
    let (name, version, arch) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || name.is_empty() || version.is_empty() || arch.is_empty() {
        return None;
    }
    Some((name.to_string(), version.to_string(), arch.to_string()))
}

async fn stanza_for(
    tooling: &dyn IndexTooling,
    repository: &RepositoryConfig,
    artifact: &Artifact,
    pool: &Path,
) -> RepoResult<Stanza> {
    let file_name = artifact.file_name();
    let pooled = pool.join(&file_name);
    tokio::fs::copy(&artifact.file_path, &pooled).await?;
    let data = tokio::fs::read(&pooled).await?;

    let (mut package, mut version, mut architecture) = parse_file_name(&file_name)
        .unwrap_or_else(|| {
            (
                artifact.component_name.clone(),
                artifact.resolved_version.clone(),
                ARCH_ALL.to_string(),
            )
        });

    let fields = control_fields(tooling, PackageType::Deb, &pooled).await?;
    if let Some(value) = fields.get("Package") {
        package = value.clone();
    }
    if let Some(value) = fields.get("Version") {
        version = value.clone();
    }
    if let Some(value) = fields.get("Architecture") {
        architecture = value.clone();
    }

    Ok(Stanza {
        package,
        version,
        architecture,
        fields,
        filename: format!("pool/{}/{}", repository.component, file_name),
        digest: FileDigest::of(&data),
    })
}

fn render_release(
    repository: &RepositoryConfig,
    architectures: &BTreeSet<String>,
    indexes: &[(String, FileDigest)],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Origin: pkgrelay");
    let _ = writeln!(out, "Label: pkgrelay");
    let _ = writeln!(out, "Suite: {}", repository.distribution);
    let _ = writeln!(out, "Codename: {}", repository.distribution);
    let _ = writeln!(
        out,
        "Architectures: {}",
        architectures.iter().cloned().collect::<Vec<_>>().join(" ")
    );
    let _ = writeln!(out, "Components: {}", repository.component);
    let _ = writeln!(out, "Description: {} packages", repository.distribution);
    let _ = writeln!(out, "MD5Sum:");
    for (path, digest) in indexes {
        let _ = writeln!(out, " {} {:>16} {}", digest.md5, digest.size, path);
    }
    let _ = writeln!(out, "SHA256:");
    for (path, digest) in indexes {
        let _ = writeln!(out, " {} {:>16} {}", digest.sha256, digest.size, path);
    }
    out
}

/// Write the APT tree for `artifacts` under `root`, returning the index
/// files relative to `root`.
pub(crate) async fn generate(
    tooling: &dyn IndexTooling,
    repository: &RepositoryConfig,
    artifacts: &[&Artifact],
    root: &Path,
) -> RepoResult<Vec<PathBuf>> {
    let pool = root.join("pool").join(&repository.component);
    reset_dir(&root.join("pool")).await?;
    reset_dir(&root.join("dists")).await?;
    tokio::fs::create_dir_all(&pool).await?;

    let mut stanzas = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        stanzas.push(stanza_for(tooling, repository, artifact, &pool).await?);
    }
    stanzas.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.filename.cmp(&b.filename))
    });
    if let Some(pair) = stanzas.windows(2).find(|p| p[0].sort_key() == p[1].sort_key()) {
        let (package, version, architecture) = pair[1].sort_key();
        return Err(RepoError::InvalidPackage {
            file: pair[1].filename.clone(),
            message: format!(
                "{} {} ({}) is also provided by {}",
                package, version, architecture, pair[0].filename
            ),
        });
    }

    let mut architectures: BTreeSet<String> = repository.architectures.iter().cloned().collect();
    architectures.extend(
        stanzas
            .iter()
            .map(|s| s.architecture.clone())
            .filter(|a| a != ARCH_ALL),
    );

    let dist = Path::new("dists").join(&repository.distribution);
    let mut index_files = Vec::new();
    let mut release_entries = Vec::new();

    for arch in &architectures {
        let component_path = format!("{}/binary-{}", repository.component, arch);
        let binary_dir = root.join(&dist).join(&component_path);
        tokio::fs::create_dir_all(&binary_dir).await?;

        let packages = stanzas
            .iter()
            .filter(|s| &s.architecture == arch || s.architecture == ARCH_ALL)
            .map(Stanza::render)
            .collect::<Vec<_>>()
            .join("\n");
        let compressed = tooling.gzip(packages.as_bytes()).await?;

        tokio::fs::write(binary_dir.join("Packages"), &packages).await?;
        tokio::fs::write(binary_dir.join("Packages.gz"), &compressed).await?;
        debug!(arch = %arch, "Wrote Packages index");

        release_entries.push((
            format!("{}/Packages", component_path),
            FileDigest::of(packages.as_bytes()),
        ));
        release_entries.push((
            format!("{}/Packages.gz", component_path),
            FileDigest::of(&compressed),
        ));
        index_files.push(dist.join(&component_path).join("Packages"));
        index_files.push(dist.join(&component_path).join("Packages.gz"));
    }

    let release = render_release(repository, &architectures, &release_entries);
    tokio::fs::write(root.join(&dist).join("Release"), release).await?;
    index_files.push(dist.join("Release"));
    index_files.sort();

    Ok(index_files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("kubelet_1.32.2-1.1_amd64.deb"),
            Some((
                "kubelet".to_string(),
                "1.32.2-1.1".to_string(),
                "amd64".to_string()
            ))
        );
        assert_eq!(parse_file_name("cert-bundle.deb"), None);
        assert_eq!(parse_file_name("a_b_c_d.deb"), None);
        assert_eq!(parse_file_name("kubelet_1.0_amd64.rpm"), None);
    }

    #[test]
    fn test_stanza_field_order() {
        let mut fields = BTreeMap::new();
        fields.insert("Maintainer".to_string(), "ops".to_string());
        fields.insert("Description".to_string(), "agent\n more".to_string());
        fields.insert("Size".to_string(), "999".to_string());
        let stanza = Stanza {
            package: "kubelet".to_string(),
            version: "1.32.2".to_string(),
            architecture: "amd64".to_string(),
            fields,
            filename: "pool/main/kubelet_1.32.2_amd64.deb".to_string(),
            digest: FileDigest::of(b"deb"),
        };

        let rendered = stanza.render();
        let keys: Vec<&str> = rendered
            .lines()
            .filter(|l| !l.starts_with(' '))
            .filter_map(|l| l.split_once(':').map(|(k, _)| k))
            .collect();
        assert_eq!(
            keys,
            vec![
                "Package",
                "Version",
                "Architecture",
                "Maintainer",
                "Filename",
                "Size",
                "MD5sum",
                "SHA256",
                "Description"
            ]
        );
        assert!(rendered.contains("Size: 3\n"));
        assert!(rendered.ends_with("Description: agent\n more\n"));
    }

    #[test]
    fn test_release_lists_every_index() {
        let repository = RepositoryConfig::default();
        let architectures: BTreeSet<String> = ["amd64".to_string()].into();
        let entries = vec![("main/binary-amd64/Packages".to_string(), FileDigest::of(b""))];
        let release = render_release(&repository, &architectures, &entries);

        assert!(release.contains("Suite: stable\n"));
        assert!(release.contains("Architectures: amd64\n"));
        assert!(release.contains(" d41d8cd98f00b204e9800998ecf8427e                0 main/binary-amd64/Packages\n"));
        assert!(!release.contains("Date:"));
    }
}
