//! Idempotent publishing with bounded retry.
//!
//! Every item is keyed by its [`ArtifactIdentity`] and file name. An item
//! already recorded as published with the same checksum, or already held
//! by the registry, is skipped without uploading. Uploads for one identity
//! are serialized; distinct identities upload concurrently up to the
//! configured limit.
//!
//! A permanent registry error (4xx other than 409) halts the publisher:
//! items that have not started are recorded as failed without contacting
//! the registry.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use pkgrelay_config::{RegistryConfig, RetryConfig};
use pkgrelay_core::artifact::sha256_file;
use pkgrelay_core::registry::{
    RegistryClient, RegistryError, RemoteLookup, UploadResponse, UploadTarget,
};
use pkgrelay_core::{
    AbortSignal, Artifact, ArtifactIdentity, PackageType, PublishRecord, PublishStatus,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// One file to publish.
#[derive(Debug, Clone)]
pub struct PublishItem {
    pub identity: ArtifactIdentity,
    pub target: UploadTarget,
    pub path: PathBuf,
    pub checksum: String,
}

impl PublishItem {
    /// Publish an artifact under its component name and resolved version.
    pub fn from_artifact(artifact: &Artifact) -> Self {
        Self {
            identity: artifact.identity(),
            target: UploadTarget {
                package: artifact.component_name.clone(),
                version: artifact.resolved_version.clone(),
                file_name: artifact.file_name(),
            },
            path: artifact.file_path.clone(),
            checksum: artifact.checksum.clone(),
        }
    }

    /// Publish a generated index file. Index files are grouped under the
    /// package `repo-<type>` and versioned by the index digest, so an
    /// unchanged repository publishes nothing new.
    pub fn index_file(
        package_type: PackageType,
        digest: &str,
        root: &Path,
        relative: &Path,
    ) -> pkgrelay_core::Result<Self> {
        let package = format!("repo-{}", package_type);
        let version = digest.chars().take(16).collect::<String>();
        let path = root.join(relative);
        let checksum = sha256_file(&path)?;
        let file_name = relative.to_string_lossy().replace(['/', '\\'], "_");

        Ok(Self {
            identity: ArtifactIdentity {
                component_name: package.clone(),
                resolved_version: version.clone(),
                package_type,
            },
            target: UploadTarget {
                package,
                version,
                file_name,
            },
            path,
            checksum,
        })
    }

    fn key(&self) -> (ArtifactIdentity, String) {
        (self.identity.clone(), self.target.file_name.clone())
    }
}

/// Outcome of publishing a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishReport {
    /// One record per item, in input order.
    pub records: Vec<PublishRecord>,
    /// Set when a permanent registry error stopped publishing.
    pub halted: Option<String>,
}

impl PublishReport {
    pub fn count(&self, status: PublishStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.halted.is_none() && self.count(PublishStatus::Failed) == 0
    }
}

/// Retry schedule for one upload. The number of attempts is bounded by
/// `max_attempts`, not by elapsed time.
pub fn retry_backoff(retry: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(retry.initial_delay)
        .with_max_interval(retry.max_delay)
        .with_multiplier(retry.multiplier)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build()
}

enum Attempt {
    Done(PublishStatus, Option<String>),
    Halt(String),
}

pub struct Publisher {
    client: Arc<dyn RegistryClient>,
    retry: RetryConfig,
    permits: Semaphore,
    abort: AbortSignal,
    /// Per-identity upload locks.
    locks: Mutex<HashMap<ArtifactIdentity, Arc<Mutex<()>>>>,
    /// Published or skipped items of this publisher, by identity and file.
    ledger: Mutex<HashMap<(ArtifactIdentity, String), PublishRecord>>,
    halted: OnceLock<String>,
}

impl Publisher {
    pub fn new(client: Arc<dyn RegistryClient>, config: &RegistryConfig) -> Self {
        Self {
            client,
            retry: config.retry.clone(),
            permits: Semaphore::new(config.concurrency.max(1)),
            abort: AbortSignal::never(),
            locks: Mutex::new(HashMap::new()),
            ledger: Mutex::new(HashMap::new()),
            halted: OnceLock::new(),
        }
    }

    /// Stop in-flight uploads when `abort` fires.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// The permanent error that halted publishing, if any.
    pub fn halted(&self) -> Option<&str> {
        self.halted.get().map(String::as_str)
    }

    /// Records of everything published or skipped so far.
    pub async fn ledger(&self) -> Vec<PublishRecord> {
        let mut records: Vec<PublishRecord> = self.ledger.lock().await.values().cloned().collect();
        records.sort_by(|a, b| {
            (&a.identity, &a.file_name).cmp(&(&b.identity, &b.file_name))
        });
        records
    }

    /// Publish `items` concurrently.
    pub async fn publish_all(&self, items: &[PublishItem]) -> PublishReport {
        let records = join_all(items.iter().map(|item| self.publish(item))).await;
        PublishReport {
            records,
            halted: self.halted.get().cloned(),
        }
    }

    /// Publish one item.
    pub async fn publish(&self, item: &PublishItem) -> PublishRecord {
        let lock = self.identity_lock(&item.identity).await;
        let _serialized = lock.lock().await;

        if let Some(record) = self.already_published(item).await {
            debug!(identity = %item.identity, "Already published in this run");
            return record;
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return self.record(item, PublishStatus::Failed, 0, Some("publisher closed".into()));
        };

        if let Some(reason) = self.halted.get() {
            return self.record(
                item,
                PublishStatus::Failed,
                0,
                Some(format!("not attempted: publishing halted: {}", reason)),
            );
        }
        if let Some(reason) = self.abort.reason() {
            return self.record(
                item,
                PublishStatus::Failed,
                0,
                Some(format!("not attempted: {}", reason)),
            );
        }

        let (status, attempts, message) = match self.check_remote(item).await {
            Some(Attempt::Done(status, message)) => (status, 0, message),
            Some(Attempt::Halt(message)) => (PublishStatus::Failed, 0, Some(self.halt(message))),
            None => self.upload_with_retry(item).await,
        };

        let record = self.record(item, status, attempts, message);
        if record.status != PublishStatus::Failed {
            self.ledger.lock().await.insert(item.key(), record.clone());
        }
        match record.status {
            PublishStatus::Published => {
                info!(identity = %item.identity, file = %item.target.file_name, attempts, "Published")
            }
            PublishStatus::Skipped => {
                info!(identity = %item.identity, file = %item.target.file_name, "Skipped")
            }
            PublishStatus::Failed => warn!(
                identity = %item.identity,
                file = %item.target.file_name,
                attempts,
                message = record.message.as_deref().unwrap_or(""),
                "Publish failed"
            ),
        }
        record
    }

    async fn identity_lock(&self, identity: &ArtifactIdentity) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    async fn already_published(&self, item: &PublishItem) -> Option<PublishRecord> {
        let ledger = self.ledger.lock().await;
        let previous = ledger.get(&item.key())?;
        (previous.checksum == item.checksum).then(|| {
            self.record(
                item,
                PublishStatus::Skipped,
                0,
                Some(format!("already {:?} in this run", previous.status).to_lowercase()),
            )
        })
    }

    /// Ask the registry whether the file is already there. `None` means
    /// the upload should go ahead.
    async fn check_remote(&self, item: &PublishItem) -> Option<Attempt> {
        match self.client.lookup(&item.target).await {
            Ok(RemoteLookup::Present { sha256: Some(remote) }) if remote == item.checksum => Some(
                Attempt::Done(PublishStatus::Skipped, Some("already in registry".into())),
            ),
            Ok(RemoteLookup::Present { sha256: Some(remote) }) => Some(Attempt::Done(
                PublishStatus::Failed,
                Some(format!(
                    "registry holds different content (sha256 {}, local {})",
                    remote, item.checksum
                )),
            )),
            Ok(RemoteLookup::Present { sha256: None }) => Some(Attempt::Done(
                PublishStatus::Skipped,
                Some("already in registry".into()),
            )),
            Ok(RemoteLookup::Absent | RemoteLookup::Unsupported) => None,
            Err(e) if e.is_transient() => {
                debug!(identity = %item.identity, error = %e, "Existence check failed, uploading");
                None
            }
            Err(e) => Some(Attempt::Halt(e.to_string())),
        }
    }

    async fn upload_with_retry(&self, item: &PublishItem) -> (PublishStatus, u32, Option<String>) {
        let body = match tokio::fs::read(&item.path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                return (
                    PublishStatus::Failed,
                    0,
                    Some(format!("cannot read {}: {}", item.path.display(), e)),
                );
            }
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = retry_backoff(&self.retry);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                result = self.client.upload(&item.target, body.clone()) => result,
                reason = self.abort.aborted() => {
                    return (PublishStatus::Failed, attempt, Some(format!("upload aborted: {}", reason)));
                }
            };

            let error = match result {
                Ok(UploadResponse::Created) => return (PublishStatus::Published, attempt, None),
                Ok(UploadResponse::AlreadyExists) => {
                    return (
                        PublishStatus::Skipped,
                        attempt,
                        Some("registry reported conflict".into()),
                    );
                }
                Err(e) => e,
            };

            let delay = match error {
                RegistryError::Transient(_) if attempt < max_attempts => backoff.next_backoff(),
                _ => None,
            };
            match (error, delay) {
                (RegistryError::Transient(message), Some(delay)) => {
                    warn!(
                        identity = %item.identity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient upload failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        reason = self.abort.aborted() => {
                            return (PublishStatus::Failed, attempt, Some(format!("upload aborted: {}", reason)));
                        }
                    }
                }
                (RegistryError::Transient(message), None) => {
                    return (
                        PublishStatus::Failed,
                        attempt,
                        Some(format!("giving up after {} attempts: {}", attempt, message)),
                    );
                }
                (permanent, _) => {
                    return (PublishStatus::Failed, attempt, Some(self.halt(permanent.to_string())));
                }
            }
        }
    }

    fn halt(&self, message: String) -> String {
        if self.halted.set(message.clone()).is_ok() {
            warn!(error = %message, "Permanent registry error, halting publishing");
        }
        message
    }

    fn record(
        &self,
        item: &PublishItem,
        status: PublishStatus,
        attempts: u32,
        message: Option<String>,
    ) -> PublishRecord {
        PublishRecord {
            identity: item.identity.clone(),
            file_name: item.target.file_name.clone(),
            checksum: item.checksum.clone(),
            remote_url: self.client.url_for(&item.target),
            status,
            attempts,
            message,
            attempted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retry_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
        };
        let mut backoff = retry_backoff(&retry);
        let mut next = || backoff.next_backoff().map(|d| d.as_millis());
        assert_eq!(next(), Some(100));
        assert_eq!(next(), Some(200));
        assert_eq!(next(), Some(350));
        for _ in 0..20 {
            assert_eq!(next(), Some(350));
        }
    }
}
