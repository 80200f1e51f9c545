//! Artifact publishing for pkgrelay.
//!
//! The [`Publisher`] uploads artifacts and index files through a
//! [`RegistryClient`](pkgrelay_core::registry::RegistryClient), skipping
//! anything already published and retrying transient failures.

pub mod http;
pub mod memory;
pub mod publisher;

pub use http::HttpRegistryClient;
pub use memory::MemoryRegistry;
pub use publisher::{PublishItem, PublishReport, Publisher, retry_backoff};
