//! Version resolution and package repository metadata for pkgrelay.
//!
//! - [`version`] extracts a version for each artifact from its file name,
//!   falling back to the job's declared version.
//! - [`deb`] and [`rpm`] lay out apt-style and yum-style repository trees
//!   and write their index files.
//! - [`tooling`] wraps the external programs used to read package control
//!   data and compress indexes.

pub mod deb;
pub mod error;
pub mod generator;
pub mod rpm;
pub mod tooling;
pub mod version;

pub use error::{RepoError, RepoResult};
pub use generator::{MetadataGenerator, RepositoryIndex};
pub use tooling::{IndexTooling, SystemTooling};
pub use version::{ResolvedVersion, VersionSource, resolve_version};
