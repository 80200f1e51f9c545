//! Repository and version errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("cannot resolve a version for '{file}' (declared: {declared:?})")]
    VersionResolution {
        file: String,
        declared: Option<String>,
    },

    #[error("indexing tool '{tool}' unavailable: {reason}")]
    ToolingUnavailable { tool: String, reason: String },

    #[error("invalid package '{file}': {message}")]
    InvalidPackage { file: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    pub fn tooling(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        RepoError::ToolingUnavailable {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

impl From<pkgrelay_core::Error> for RepoError {
    fn from(e: pkgrelay_core::Error) -> Self {
        match e {
            pkgrelay_core::Error::Io(io) => RepoError::Io(io),
            other => RepoError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;
