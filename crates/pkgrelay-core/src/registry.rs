//! Remote package registry capability.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where an upload lands on the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadTarget {
    /// Package namespace, e.g. the component name.
    pub package: String,
    pub version: String,
    pub file_name: String,
}

/// Result of asking the registry whether a file already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLookup {
    Absent,
    /// Present; the checksum is included when the registry reports one.
    Present { sha256: Option<String> },
    /// The registry cannot answer existence queries.
    Unsupported,
}

/// Successful upload outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResponse {
    Created,
    /// 409: the registry already holds this file.
    AlreadyExists,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Network errors and 5xx responses. Worth retrying.
    #[error("transient registry error: {0}")]
    Transient(String),

    /// 4xx other than 409. Retrying will not help.
    #[error("registry rejected request ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("invalid registry request: {0}")]
    Invalid(String),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_))
    }

    /// Classify an HTTP status that is neither success nor 409.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status >= 500 || status == 408 || status == 429 {
            RegistryError::Transient(format!("HTTP {status}: {}", message.into()))
        } else {
            RegistryError::Permanent {
                status,
                message: message.into(),
            }
        }
    }
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Trait for remote registries.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Public URL of a target, for the publish log.
    fn url_for(&self, target: &UploadTarget) -> String;

    /// Check whether `target` already exists remotely.
    async fn lookup(&self, _target: &UploadTarget) -> RegistryResult<RemoteLookup> {
        Ok(RemoteLookup::Unsupported)
    }

    /// Upload `body` to `target`.
    async fn upload(&self, target: &UploadTarget, body: Bytes) -> RegistryResult<UploadResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RegistryError::from_status(500, "boom").is_transient());
        assert!(RegistryError::from_status(503, "").is_transient());
        assert!(RegistryError::from_status(429, "slow down").is_transient());
        assert!(matches!(
            RegistryError::from_status(401, "bad token"),
            RegistryError::Permanent { status: 401, .. }
        ));
        assert!(!RegistryError::from_status(404, "").is_transient());
    }
}
