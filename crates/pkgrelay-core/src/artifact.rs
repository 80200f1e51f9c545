//! Built artifacts and their publish identity.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::{PackageType, Result};

/// Idempotency key for publishing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{component_name}@{resolved_version}/{package_type}")]
pub struct ArtifactIdentity {
    pub component_name: String,
    pub resolved_version: String,
    pub package_type: PackageType,
}

/// A package file derived from a successful build. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub component_name: String,
    pub package_type: PackageType,
    pub file_path: PathBuf,
    pub resolved_version: String,
    /// Hex-encoded SHA-256 of the file contents.
    pub checksum: String,
}

impl Artifact {
    pub fn identity(&self) -> ArtifactIdentity {
        ArtifactIdentity {
            component_name: self.component_name.clone(),
            resolved_version: self.resolved_version.clone(),
            package_type: self.package_type,
        }
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Hex SHA-256 of a file, read in chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
