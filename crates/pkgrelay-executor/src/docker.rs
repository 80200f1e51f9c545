//! Docker executor implementation.
//!
//! Each build job runs in its own container. The job directory (holding
//! both the work and output directories) is bind-mounted at the same path
//! inside the container, so interpolated host paths stay valid.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use pkgrelay_core::executor::{BuildExecutor, BuildRequest};
use pkgrelay_core::job::safe_name;
use pkgrelay_core::{Error, Result, RunId};
use tracing::{debug, info, warn};

/// Runs build commands inside Docker containers.
pub struct DockerExecutor {
    docker: Docker,
    /// Image for jobs that do not name a runner.
    default_image: Option<String>,
}

impl DockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new(default_image: Option<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            docker,
            default_image,
        })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, default_image: Option<String>) -> Self {
        Self {
            docker,
            default_image,
        }
    }

    fn container_name(run_id: &RunId, job_name: &str) -> String {
        format!("pkgrelay-{}-{}", run_id, safe_name(job_name))
    }

    fn image_for(&self, request: &BuildRequest) -> Result<String> {
        request
            .runner
            .clone()
            .or_else(|| self.default_image.clone())
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "job '{}' names no runner image and no default image is configured",
                    request.job_name
                ))
            })
    }

    async fn pull(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    async fn remove(&self, container_name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            warn!(container = %container_name, error = %e, "Failed to remove container");
        }
    }

    async fn forward_logs(&self, container_name: &str, job_name: &str) {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_name, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdErr { message }) => {
                    debug!(job = %job_name, stream = "stderr", "{}", String::from_utf8_lossy(&message).trim_end());
                }
                Ok(output) => {
                    debug!(job = %job_name, stream = "stdout", "{}", output.to_string().trim_end());
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    break;
                }
            }
        }
    }

    async fn wait_exit_code(&self, container_name: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::ExecutionFailed(format!(
                "failed to wait for container: {}",
                e
            ))),
            None => Err(Error::ExecutionFailed(
                "container wait stream ended without a status".to_string(),
            )),
        }
    }
}

#[async_trait]
impl BuildExecutor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn execute(&self, request: BuildRequest) -> Result<()> {
        let image = self.image_for(&request)?;
        let container_name = Self::container_name(&request.run_id, &request.job_name);

        tokio::fs::create_dir_all(&request.work_dir).await?;
        let job_dir = request
            .output_dir
            .parent()
            .unwrap_or(&request.work_dir)
            .to_path_buf();

        self.pull(&image).await;

        let env: Vec<String> = request
            .env()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{0}:{0}:rw",
                job_dir.to_string_lossy()
            )]),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                request.command.clone(),
            ]),
            env: Some(env),
            working_dir: Some(request.work_dir.to_string_lossy().to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, image = %image, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&container_name).await;
            return Err(Error::ExecutionFailed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        let exit_code = tokio::select! {
            code = self.wait_exit_code(&container_name) => code,
            reason = request.abort.aborted() => {
                warn!(container = %container_name, %reason, "Removing container");
                self.remove(&container_name).await;
                return Err(Error::Cancelled(reason.to_string()));
            }
        };

        self.forward_logs(&container_name, &request.job_name).await;
        self.remove(&container_name).await;

        match exit_code? {
            0 => Ok(()),
            code => Err(Error::ExecutionFailed(format!(
                "container exited with status {}",
                code
            ))),
        }
    }
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use pkgrelay_core::AbortSignal;
    use std::collections::BTreeMap;

    #[tokio::test]
    #[ignore]
    async fn test_container_build_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let executor = DockerExecutor::new(Some("alpine:latest".to_string())).unwrap();

        let request = BuildRequest {
            run_id: RunId::new(),
            job_name: "hello".to_string(),
            command: format!("mkdir -p {0} && touch {0}/hello_1.0.0_all.deb", out.display()),
            parameters: BTreeMap::new(),
            runner: None,
            work_dir: dir.path().join("work"),
            output_dir: out.clone(),
            abort: AbortSignal::never(),
        };

        executor.execute(request).await.unwrap();
        assert!(out.join("hello_1.0.0_all.deb").exists());
    }
}
