//! Secret provider abstraction.
//!
//! The publish credential is looked up by name at run time so the
//! configuration never carries the literal token.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::{Error, Result};

/// A secret value. `Debug` never prints the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Trait for secret backends.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Get a secret by name.
    async fn get(&self, name: &str) -> Result<Secret>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretProvider {
    prefix: String,
}

impl EnvSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `{prefix}{name}` instead of `name`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get(&self, name: &str) -> Result<Secret> {
        let key = format!("{}{}", self.prefix, name);
        match std::env::var(&key) {
            Ok(value) if !value.is_empty() => Ok(Secret(value)),
            _ => Err(Error::NotFound(format!("secret '{key}'"))),
        }
    }
}

/// In-memory secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, Secret>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), Secret::new(value));
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get(&self, name: &str) -> Result<Secret> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret '{name}'")))
    }
}
