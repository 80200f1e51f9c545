//! Core domain types and traits for pkgrelay.
//!
//! This crate contains:
//! - Run identifiers and the shared error type
//! - Job specifications and per-job build results
//! - Artifacts and their publish identity
//! - The build executor, secret provider and registry client capabilities
//! - The abort signal shared by builds and uploads

pub mod artifact;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod publish;
pub mod registry;
pub mod secret;
pub mod signal;

pub use artifact::{Artifact, ArtifactIdentity};
pub use error::{Error, Result};
pub use id::RunId;
pub use job::{BuildResult, BuildStatus, JobSpec, PackageType};
pub use publish::{PublishRecord, PublishStatus};
pub use signal::{AbortHandle, AbortReason, AbortSignal};
