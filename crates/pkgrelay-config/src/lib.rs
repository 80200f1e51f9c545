//! KDL configuration parsing for pkgrelay.
//!
//! This crate handles parsing of:
//! - The job table (one `job` node per component)
//! - Run, executor, repository and registry settings
//! - `${...}` parameter interpolation into command templates

pub mod error;
pub mod project;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use project::{ProjectConfig, load_config, parse_config};
pub use system::{ExecutorConfig, RegistryConfig, RepositoryConfig, RetryConfig, RunConfig};
pub use variables::ParameterContext;
