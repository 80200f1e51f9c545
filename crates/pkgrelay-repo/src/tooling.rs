//! External programs used while indexing.

use async_trait::async_trait;
use pkgrelay_core::PackageType;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{RepoError, RepoResult};

/// Field separator for the rpm query format.
const RPM_QUERY_FORMAT: &str = "%{NAME}\\t%{VERSION}\\t%{RELEASE}\\t%{ARCH}\\t%{SUMMARY}\\n";

/// Reads package control data and compresses index files.
///
/// Errors other than [`RepoError::ToolingUnavailable`] from
/// `control_fields` are treated as a problem with that one package.
#[async_trait]
pub trait IndexTooling: Send + Sync {
    /// Control fields embedded in a package file.
    async fn control_fields(
        &self,
        package_type: PackageType,
        path: &Path,
    ) -> RepoResult<BTreeMap<String, String>>;

    /// Gzip `data` without embedding a name or timestamp.
    async fn gzip(&self, data: &[u8]) -> RepoResult<Vec<u8>>;
}

/// `dpkg-deb`, `rpm` and `gzip` from the host.
#[derive(Debug, Clone, Default)]
pub struct SystemTooling;

impl SystemTooling {
    pub fn new() -> Self {
        Self
    }

    async fn run(tool: &str, command: &mut Command) -> RepoResult<Output> {
        debug!(tool, "Running indexing tool");
        command.output().await.map_err(|e| spawn_error(tool, e))
    }
}

fn spawn_error(tool: &str, e: std::io::Error) -> RepoError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => RepoError::tooling(tool, e.to_string()),
        _ => RepoError::Io(e),
    }
}

fn invalid(path: &Path, tool: &str, output: &Output) -> RepoError {
    RepoError::InvalidPackage {
        file: path.display().to_string(),
        message: format!(
            "{} exited with {}: {}",
            tool,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

/// Parse RFC 822 style control output. Continuation lines are kept with
/// their leading whitespace so the value can be written back verbatim.
pub fn parse_control(text: &str) -> BTreeMap<String, String> {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some(value) = current.as_ref().and_then(|key| fields.get_mut(key)) {
                value.push('\n');
                value.push_str(line);
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            fields.insert(key.clone(), value.trim().to_string());
            current = Some(key);
        }
    }
    fields
}

fn parse_rpm_query(text: &str) -> BTreeMap<String, String> {
    let names = ["Name", "Version", "Release", "Arch", "Summary"];
    names
        .iter()
        .zip(text.trim_end_matches('\n').split('\t'))
        .filter(|(_, value)| !value.is_empty() && *value != "(none)")
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[async_trait]
impl IndexTooling for SystemTooling {
    async fn control_fields(
        &self,
        package_type: PackageType,
        path: &Path,
    ) -> RepoResult<BTreeMap<String, String>> {
        match package_type {
            PackageType::Deb => {
                let output =
                    Self::run("dpkg-deb", Command::new("dpkg-deb").arg("--field").arg(path))
                        .await?;
                if !output.status.success() {
                    return Err(invalid(path, "dpkg-deb", &output));
                }
                Ok(parse_control(&String::from_utf8_lossy(&output.stdout)))
            }
            PackageType::Rpm => {
                let output = Self::run(
                    "rpm",
                    Command::new("rpm")
                        .arg("-qp")
                        .arg("--queryformat")
                        .arg(RPM_QUERY_FORMAT)
                        .arg(path),
                )
                .await?;
                if !output.status.success() {
                    return Err(invalid(path, "rpm", &output));
                }
                Ok(parse_rpm_query(&String::from_utf8_lossy(&output.stdout)))
            }
        }
    }

    async fn gzip(&self, data: &[u8]) -> RepoResult<Vec<u8>> {
        let mut child = Command::new("gzip")
            .args(["-9", "-n", "-c"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error("gzip", e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RepoError::tooling("gzip", "stdin not captured"))?;
        let input = data.to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await?;
        writer
            .await
            .map_err(|e| RepoError::tooling("gzip", e.to_string()))??;

        if !output.status.success() {
            return Err(RepoError::tooling(
                "gzip",
                format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(output.stdout)
    }
}
