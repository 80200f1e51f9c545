//! HTTP registry client against an in-process generic-package server.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use pkgrelay_config::{RegistryConfig, RetryConfig};
use pkgrelay_core::artifact::sha256_bytes;
use pkgrelay_core::registry::{RegistryClient, RegistryError, RemoteLookup, UploadResponse, UploadTarget};
use pkgrelay_core::secret::{Secret, StaticSecretProvider};
use pkgrelay_core::{Artifact, PackageType, PublishStatus};
use pkgrelay_publisher::{HttpRegistryClient, PublishItem, Publisher};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOKEN: &str = "secret-token";

#[derive(Default)]
struct Registry {
    /// (package, version) -> file name -> sha256
    files: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
    /// Remaining forced 500 responses per file name.
    failures: Mutex<HashMap<String, u32>>,
}

type Shared = Arc<Registry>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn upload(
    State(registry): State<Shared>,
    Path((_owner, package, version, file)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    {
        let mut failures = registry.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&file).filter(|left| **left > 0) {
            *left -= 1;
            return (StatusCode::INTERNAL_SERVER_ERROR, "try again").into_response();
        }
    }

    let mut files = registry.files.lock().unwrap();
    let version_files = files.entry((package, version)).or_default();
    if version_files.contains_key(&file) {
        return (StatusCode::CONFLICT, "file exists").into_response();
    }
    version_files.insert(file, sha256_bytes(&body));
    StatusCode::CREATED.into_response()
}

async fn list_files(
    State(registry): State<Shared>,
    Path((_owner, package, version)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    let files = registry.files.lock().unwrap();
    match files.get(&(package, version)) {
        Some(entries) => axum::Json(
            entries
                .iter()
                .map(|(name, sha)| json!({ "name": name, "sha256": sha, "size": 1 }))
                .collect::<Vec<_>>(),
        )
        .into_response(),
        None => (StatusCode::NOT_FOUND, "package not found").into_response(),
    }
}

async fn serve(registry: Shared) -> String {
    let app = Router::new()
        .route(
            "/api/packages/{owner}/generic/{package}/{version}/{file}",
            put(upload),
        )
        .route(
            "/api/v1/packages/{owner}/generic/{package}/{version}/files",
            get(list_files),
        )
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn target(file: &str) -> UploadTarget {
    UploadTarget {
        package: "kubelet".to_string(),
        version: "1.32.2".to_string(),
        file_name: file.to_string(),
    }
}

#[tokio::test]
async fn upload_then_lookup_reports_checksum() {
    let base = serve(Shared::default()).await;
    let client = HttpRegistryClient::new(&base, "acme", Secret::new(TOKEN)).unwrap();
    let body = Bytes::from_static(b"kubelet package");

    assert_eq!(
        client.lookup(&target("kubelet_1.32.2_amd64.deb")).await.unwrap(),
        RemoteLookup::Absent
    );
    assert_eq!(
        client
            .upload(&target("kubelet_1.32.2_amd64.deb"), body.clone())
            .await
            .unwrap(),
        UploadResponse::Created
    );
    assert_eq!(
        client.lookup(&target("kubelet_1.32.2_amd64.deb")).await.unwrap(),
        RemoteLookup::Present {
            sha256: Some(sha256_bytes(&body))
        }
    );
    assert_eq!(
        client.lookup(&target("kubelet_1.32.2_arm64.deb")).await.unwrap(),
        RemoteLookup::Absent
    );
    assert_eq!(
        client
            .upload(&target("kubelet_1.32.2_amd64.deb"), body)
            .await
            .unwrap(),
        UploadResponse::AlreadyExists
    );
}

#[tokio::test]
async fn bad_token_is_permanent() {
    let base = serve(Shared::default()).await;
    let client = HttpRegistryClient::new(&base, "acme", Secret::new("wrong")).unwrap();

    let err = client
        .upload(&target("kubelet_1.32.2_amd64.deb"), Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Permanent { status: 401, .. }));
}

#[tokio::test]
async fn server_errors_are_transient() {
    let registry = Shared::default();
    registry
        .failures
        .lock()
        .unwrap()
        .insert("kubelet_1.32.2_amd64.deb".to_string(), 1);
    let base = serve(registry).await;
    let client = HttpRegistryClient::new(&base, "acme", Secret::new(TOKEN)).unwrap();

    let err = client
        .upload(&target("kubelet_1.32.2_amd64.deb"), Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn unreachable_registry_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client =
        HttpRegistryClient::new(&format!("http://{addr}"), "acme", Secret::new(TOKEN)).unwrap();
    let err = client
        .upload(&target("kubelet_1.32.2_amd64.deb"), Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn publisher_retries_against_http_registry() {
    let registry = Shared::default();
    registry
        .failures
        .lock()
        .unwrap()
        .insert("kubelet_1.32.2_amd64.deb".to_string(), 2);
    let base = serve(registry.clone()).await;

    let mut config = RegistryConfig::new(&base, "acme");
    config.retry = RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        multiplier: 2.0,
    };
    let secrets = StaticSecretProvider::new().with_secret("PKGRELAY_TOKEN", TOKEN);
    let client = HttpRegistryClient::from_config(&config, &secrets).await.unwrap();
    let publisher = Publisher::new(Arc::new(client), &config);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kubelet_1.32.2_amd64.deb");
    std::fs::write(&path, b"kubelet package").unwrap();
    let artifact = Artifact {
        component_name: "kubelet".to_string(),
        package_type: PackageType::Deb,
        file_path: path,
        resolved_version: "1.32.2".to_string(),
        checksum: sha256_bytes(b"kubelet package"),
    };
    let item = PublishItem::from_artifact(&artifact);

    let record = publisher.publish(&item).await;
    assert_eq!(record.status, PublishStatus::Published);
    assert_eq!(record.attempts, 3);
    assert_eq!(
        record.remote_url,
        format!("{base}/api/packages/acme/generic/kubelet/1.32.2/kubelet_1.32.2_amd64.deb")
    );

    // Cross-run idempotency through the files listing.
    let client = HttpRegistryClient::from_config(&config, &secrets).await.unwrap();
    let second = Publisher::new(Arc::new(client), &config).publish(&item).await;
    assert_eq!(second.status, PublishStatus::Skipped);
    assert_eq!(second.attempts, 0);
}
