//! In-memory registry used for dry runs.

use async_trait::async_trait;
use bytes::Bytes;
use pkgrelay_core::artifact::sha256_bytes;
use pkgrelay_core::registry::{
    RegistryClient, RegistryResult, RemoteLookup, UploadResponse, UploadTarget,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

/// Records uploads instead of sending them anywhere. Behaves like the
/// HTTP registry: existence checks report checksums and a second upload
/// of the same file is a conflict.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    files: Mutex<BTreeMap<(String, String, String), String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(target: &UploadTarget) -> (String, String, String) {
        (
            target.package.clone(),
            target.version.clone(),
            target.file_name.clone(),
        )
    }

    /// Everything uploaded so far, as `(url, sha256)`.
    pub fn uploads(&self) -> Vec<(String, String)> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files
            .iter()
            .map(|((package, version, file), sha)| {
                (format!("memory://{}/{}/{}", package, version, file), sha.clone())
            })
            .collect()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    fn url_for(&self, target: &UploadTarget) -> String {
        format!(
            "memory://{}/{}/{}",
            target.package, target.version, target.file_name
        )
    }

    async fn lookup(&self, target: &UploadTarget) -> RegistryResult<RemoteLookup> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match files.get(&Self::key(target)) {
            Some(sha) => RemoteLookup::Present {
                sha256: Some(sha.clone()),
            },
            None => RemoteLookup::Absent,
        })
    }

    async fn upload(&self, target: &UploadTarget, body: Bytes) -> RegistryResult<UploadResponse> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let key = Self::key(target);
        if files.contains_key(&key) {
            return Ok(UploadResponse::AlreadyExists);
        }
        info!(url = %self.url_for(target), bytes = body.len(), "Dry run: recorded upload");
        files.insert(key, sha256_bytes(&body));
        Ok(UploadResponse::Created)
    }
}
