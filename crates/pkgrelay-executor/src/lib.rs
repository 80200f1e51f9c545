//! Build executor backends for pkgrelay.
//!
//! Provides implementations of [`BuildExecutor`]:
//! - Local shell (development, CI hosts with the toolchain installed)
//! - Docker (one container per build job)

pub mod docker;
pub mod shell;

pub use docker::DockerExecutor;
pub use pkgrelay_core::executor::{BuildExecutor, BuildRequest};
pub use shell::ShellExecutor;
