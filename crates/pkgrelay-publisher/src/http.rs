//! HTTP client for generic-package registries.
//!
//! Uploads go to `PUT {base}/api/packages/{owner}/generic/{package}/{version}/{file}`
//! with a bearer token; existence checks list
//! `GET {base}/api/v1/packages/{owner}/generic/{package}/{version}/files`.

use async_trait::async_trait;
use bytes::Bytes;
use pkgrelay_config::RegistryConfig;
use pkgrelay_core::registry::{
    RegistryClient, RegistryError, RegistryResult, RemoteLookup, UploadResponse, UploadTarget,
};
use pkgrelay_core::secret::{Secret, SecretProvider};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("pkgrelay/", env!("CARGO_PKG_VERSION"));

/// A file entry of the package files listing.
#[derive(Debug, Deserialize)]
struct RemoteFile {
    name: String,
    #[serde(default)]
    sha256: Option<String>,
}

pub struct HttpRegistryClient {
    client: reqwest::Client,
    base_url: String,
    owner: String,
    token: Secret,
}

impl HttpRegistryClient {
    pub fn new(base_url: &str, owner: impl Into<String>, token: Secret) -> RegistryResult<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| RegistryError::Invalid(format!("registry url '{}': {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RegistryError::Invalid(format!(
                "registry url '{}' must be http or https",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RegistryError::Invalid(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            owner: owner.into(),
            token,
        })
    }

    /// Build a client from configuration, fetching the token by name.
    pub async fn from_config(
        config: &RegistryConfig,
        secrets: &dyn SecretProvider,
    ) -> pkgrelay_core::Result<Self> {
        let token = secrets.get(&config.token_secret).await?;
        Self::new(&config.url, config.owner.clone(), token)
            .map_err(|e| pkgrelay_core::Error::InvalidInput(e.to_string()))
    }

    fn package_path(&self, target: &UploadTarget) -> String {
        format!(
            "{}/generic/{}/{}",
            urlencoding::encode(&self.owner),
            urlencoding::encode(&target.package),
            urlencoding::encode(&target.version)
        )
    }

    fn files_url(&self, target: &UploadTarget) -> String {
        format!(
            "{}/api/v1/packages/{}/files",
            self.base_url,
            self.package_path(target)
        )
    }

    async fn error_for(response: reqwest::Response) -> RegistryError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        RegistryError::from_status(status, text.trim().to_string())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    fn url_for(&self, target: &UploadTarget) -> String {
        format!(
            "{}/api/packages/{}/{}",
            self.base_url,
            self.package_path(target),
            urlencoding::encode(&target.file_name)
        )
    }

    async fn lookup(&self, target: &UploadTarget) -> RegistryResult<RemoteLookup> {
        let response = self
            .client
            .get(self.files_url(target))
            .bearer_auth(self.token.expose())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| RegistryError::Transient(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RemoteLookup::Absent);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let files: Vec<RemoteFile> = response
            .json()
            .await
            .map_err(|e| RegistryError::Transient(format!("invalid file listing: {}", e)))?;

        Ok(files
            .into_iter()
            .find(|f| f.name == target.file_name)
            .map(|f| RemoteLookup::Present { sha256: f.sha256 })
            .unwrap_or(RemoteLookup::Absent))
    }

    async fn upload(&self, target: &UploadTarget, body: Bytes) -> RegistryResult<UploadResponse> {
        let url = self.url_for(target);
        debug!(url = %url, bytes = body.len(), "Uploading");

        let response = self
            .client
            .put(&url)
            .bearer_auth(self.token.expose())
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| RegistryError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(UploadResponse::Created),
            StatusCode::CONFLICT => Ok(UploadResponse::AlreadyExists),
            _ => Err(Self::error_for(response).await),
        }
    }
}
