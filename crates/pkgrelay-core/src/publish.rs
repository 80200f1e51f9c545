//! Publish records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ArtifactIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishStatus {
    Published,
    Skipped,
    Failed,
}

/// One entry of the append-only publish log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRecord {
    pub identity: ArtifactIdentity,
    pub file_name: String,
    pub checksum: String,
    pub remote_url: String,
    pub status: PublishStatus,
    /// Upload attempts made (zero when skipped before uploading).
    pub attempts: u32,
    pub message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl PublishRecord {
    pub fn is_published(&self) -> bool {
        self.status == PublishStatus::Published
    }
}
