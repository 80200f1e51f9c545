//! Local shell executor.

use async_trait::async_trait;
use pkgrelay_core::executor::{BuildExecutor, BuildRequest};
use pkgrelay_core::{Error, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines of stderr kept for failure messages.
const STDERR_TAIL: usize = 20;

/// Runs build commands with `/bin/sh -c` in the job's work directory.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }

    /// Use a different shell binary.
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward a child stream into tracing, keeping the last lines.
fn pipe_lines<R>(job: String, stream: &'static str, reader: R) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(job = %job, stream, "{}", line);
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect()
    })
}

#[async_trait]
impl BuildExecutor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, request: BuildRequest) -> Result<()> {
        tokio::fs::create_dir_all(&request.work_dir).await?;

        info!(job = %request.job_name, command = %request.command, "Starting build command");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.work_dir)
            .envs(request.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ExecutionFailed(format!("failed to spawn {}: {}", self.shell.display(), e))
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| pipe_lines(request.job_name.clone(), "stdout", out));
        let stderr = child
            .stderr
            .take()
            .map(|err| pipe_lines(request.job_name.clone(), "stderr", err));

        let status = tokio::select! {
            status = child.wait() => status?,
            reason = request.abort.aborted() => {
                warn!(job = %request.job_name, %reason, "Killing build command");
                if let Err(e) = child.kill().await {
                    warn!(job = %request.job_name, error = %e, "Failed to kill build command");
                }
                return Err(Error::Cancelled(reason.to_string()));
            }
        };

        if let Some(handle) = stdout {
            let _ = handle.await;
        }
        let tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if status.success() {
            Ok(())
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(Error::ExecutionFailed(format!(
                "exit status {}{}",
                code,
                if tail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", tail.join("\n"))
                }
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgrelay_core::{AbortHandle, AbortReason, AbortSignal, RunId};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;

    fn request(root: &Path, command: &str, abort: AbortSignal) -> BuildRequest {
        let mut parameters = BTreeMap::new();
        parameters.insert("component".to_string(), "kubelet".to_string());
        BuildRequest {
            run_id: RunId::new(),
            job_name: "kubelet".to_string(),
            command: command.to_string(),
            parameters,
            runner: None,
            work_dir: root.join("work"),
            output_dir: root.join("out"),
            abort,
        }
    }

    #[tokio::test]
    async fn test_successful_command_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let cmd = format!(
            "mkdir -p {0} && echo $PKGRELAY_COMPONENT > {0}/kubelet_1.0.0_amd64.deb",
            out.display()
        );

        ShellExecutor::new()
            .execute(request(dir.path(), &cmd, AbortSignal::never()))
            .await
            .unwrap();

        let written = std::fs::read_to_string(out.join("kubelet_1.0.0_amd64.deb")).unwrap();
        assert_eq!(written.trim(), "kubelet");
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShellExecutor::new()
            .execute(request(
                dir.path(),
                "echo compile error >&2; exit 3",
                AbortSignal::never(),
            ))
            .await
            .unwrap_err();

        match err {
            Error::ExecutionFailed(msg) => {
                assert!(msg.contains("exit status 3"));
                assert!(msg.contains("compile error"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let handle = AbortHandle::new();
        let signal = handle.signal();

        let task = tokio::spawn(async move {
            ShellExecutor::new()
                .execute(request(dir.path(), "sleep 30", signal))
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort(AbortReason::External);

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_missing_shell_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellExecutor::with_shell("/nonexistent/sh")
            .execute(request(dir.path(), "true", AbortSignal::never()))
            .await;
        assert!(matches!(result, Err(Error::ExecutionFailed(_))));
    }
}
