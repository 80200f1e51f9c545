//! End-to-end runs with a scripted executor and in-memory registry.

use async_trait::async_trait;
use pkgrelay_config::{ProjectConfig, RegistryConfig, RunConfig};
use pkgrelay_core::executor::{BuildExecutor, BuildRequest};
use pkgrelay_core::{
    AbortReason, BuildStatus, Error, JobSpec, PackageType, PublishStatus, Result,
};
use pkgrelay_publisher::MemoryRegistry;
use pkgrelay_repo::{IndexTooling, RepoResult};
use pkgrelay_scheduler::{
    JobRegistry, PublishState, RunError, RunEvent, RunOrchestrator, RunPlan, RunSummary,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
enum Behavior {
    /// Write these package files into the output directory.
    Write(Vec<&'static str>),
    Fail(&'static str),
    /// Succeed without creating the output directory.
    NoOutput,
    /// Run until aborted.
    Hang,
}

#[derive(Default)]
struct ScriptedExecutor {
    behaviors: HashMap<String, Behavior>,
    delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedExecutor {
    fn with(mut self, job: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(job.to_string(), behavior);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl BuildExecutor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, request: BuildRequest) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let behavior = self
            .behaviors
            .get(&request.job_name)
            .cloned()
            .unwrap_or(Behavior::Write(vec![]));
        let result = match behavior {
            Behavior::Write(files) => {
                std::fs::create_dir_all(&request.output_dir).unwrap();
                for file in files {
                    std::fs::write(request.output_dir.join(file), format!("package {file}")).unwrap();
                }
                Ok(())
            }
            Behavior::Fail(message) => Err(Error::ExecutionFailed(message.to_string())),
            Behavior::NoOutput => Ok(()),
            Behavior::Hang => {
                let reason = request.abort.aborted().await;
                Err(Error::Cancelled(reason.to_string()))
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct FakeTooling;

#[async_trait]
impl IndexTooling for FakeTooling {
    async fn control_fields(
        &self,
        _package_type: PackageType,
        _path: &Path,
    ) -> RepoResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn gzip(&self, data: &[u8]) -> RepoResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

fn config(work_dir: &Path) -> ProjectConfig {
    ProjectConfig {
        run: RunConfig {
            work_dir: work_dir.to_path_buf(),
            barrier_timeout: Duration::from_secs(10),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn plan(jobs: Vec<JobSpec>) -> RunPlan {
    RunPlan::new(JobRegistry::new(jobs).unwrap()).unwrap()
}

fn kube_jobs() -> Vec<JobSpec> {
    vec![
        JobSpec::new("kubelet", PackageType::Deb, "make kubelet").with_version("v1.32.2"),
        JobSpec::new("kubeadm", PackageType::Deb, "make kubeadm").with_version("v1.32.2"),
        JobSpec::new("cri-tools", PackageType::Rpm, "make cri-tools"),
    ]
}

fn kube_executor() -> ScriptedExecutor {
    ScriptedExecutor::default()
        .with("kubelet", Behavior::Write(vec!["kubelet_1.32.2_amd64.deb"]))
        .with("kubeadm", Behavior::Write(vec!["kubeadm_1.32.2_amd64.deb"]))
        .with("cri-tools", Behavior::Write(vec!["cri-tools-1.32.0-0.x86_64.rpm"]))
}

async fn run(orchestrator: &RunOrchestrator, plan: &RunPlan) -> (RunSummary, Vec<RunEvent>) {
    let (mut rx, handle): (mpsc::Receiver<RunEvent>, _) = orchestrator.execute(plan);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (handle.await.unwrap(), events)
}

fn status_of<'a>(summary: &'a RunSummary, job: &str) -> &'a BuildStatus {
    &summary
        .jobs
        .iter()
        .find(|j| j.job_name == job)
        .unwrap()
        .status
}

#[tokio::test]
async fn successful_run_publishes_packages_and_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let registry = Arc::new(MemoryRegistry::new());
    let orchestrator = RunOrchestrator::new(Arc::new(kube_executor()), Arc::new(FakeTooling), &config)
        .with_registry(registry.clone(), RegistryConfig::new("memory://", "acme"));

    let (summary, events) = run(&orchestrator, &plan(kube_jobs())).await;

    assert!(summary.success, "{:?}", summary.publish);
    assert_eq!(summary.into_result(), Ok(()));
    assert_eq!(summary.publish, PublishState::Succeeded);
    assert_eq!(summary.succeeded(), 3);
    assert_eq!(summary.artifacts.len(), 3);
    assert!(summary.excluded.is_empty());
    assert_eq!(summary.indexes.len(), 2);
    assert!(summary.indexes.iter().all(|i| i.index.is_some()));

    let versions: BTreeMap<_, _> = summary
        .artifacts
        .iter()
        .map(|a| (a.component_name.as_str(), a.resolved_version.as_str()))
        .collect();
    assert_eq!(versions["kubelet"], "1.32.2");
    assert_eq!(versions["cri-tools"], "1.32.0");

    let urls: Vec<String> = registry.uploads().into_iter().map(|(url, _)| url).collect();
    assert!(urls.contains(&"memory://kubelet/1.32.2/kubelet_1.32.2_amd64.deb".to_string()));
    assert!(urls.iter().any(|u| u.starts_with("memory://repo-deb/")));
    assert!(urls.iter().any(|u| u.starts_with("memory://repo-rpm/")));
    assert_eq!(summary.published(), urls.len());

    assert!(matches!(events.first(), Some(RunEvent::JobStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunCompleted { success: true })
    ));
    let finished = events
        .iter()
        .filter(|e| matches!(e, RunEvent::JobFinished { .. }))
        .count();
    assert_eq!(finished, 3);

    let position = |wanted: fn(&RunEvent) -> bool| events.iter().position(wanted);
    let started = position(|e| matches!(e, RunEvent::PublishStarted)).unwrap();
    let last_build = events
        .iter()
        .rposition(|e| matches!(e, RunEvent::JobFinished { .. }))
        .unwrap();
    let first_upload = position(|e| matches!(e, RunEvent::Published { .. })).unwrap();
    assert!(last_build < started && started < first_upload);
}

#[tokio::test]
async fn second_run_with_same_outputs_uploads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let registry = Arc::new(MemoryRegistry::new());
    let orchestrator = RunOrchestrator::new(Arc::new(kube_executor()), Arc::new(FakeTooling), &config)
        .with_registry(registry.clone(), RegistryConfig::new("memory://", "acme"));
    let plan = plan(kube_jobs());

    let (first, _) = run(&orchestrator, &plan).await;
    assert!(first.success);
    let uploaded = registry.uploads().len();

    let (second, _) = run(&orchestrator, &plan).await;
    assert!(second.success);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.published(), 0);
    assert_eq!(second.count(PublishStatus::Skipped), second.records.len());
    assert_eq!(registry.uploads().len(), uploaded);
}

#[tokio::test]
async fn failed_build_blocks_publish() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let registry = Arc::new(MemoryRegistry::new());
    let executor = kube_executor().with("kubeadm", Behavior::Fail("exit status 2"));
    let orchestrator = RunOrchestrator::new(Arc::new(executor), Arc::new(FakeTooling), &config)
        .with_registry(registry.clone(), RegistryConfig::new("memory://", "acme"));

    let (summary, events) = run(&orchestrator, &plan(kube_jobs())).await;

    assert!(!summary.success);
    assert_eq!(summary.succeeded(), 2);
    assert_eq!(summary.failed(), 1);
    assert_eq!(
        summary.publish,
        PublishState::Blocked {
            failed: vec!["kubeadm".to_string()]
        }
    );
    assert_eq!(
        summary.into_result(),
        Err(RunError::BuildsFailed(vec!["kubeadm".to_string()]))
    );
    assert!(summary.records.is_empty());
    assert!(summary.artifacts.is_empty());
    assert!(registry.uploads().is_empty());
    assert!(events.iter().any(|e| matches!(e, RunEvent::PublishBlocked { .. })));
    assert!(!events.iter().any(|e| matches!(e, RunEvent::PublishStarted)));
    assert!(matches!(
        status_of(&summary, "kubeadm"),
        BuildStatus::Failed { message } if message.contains("exit status 2")
    ));
}

#[tokio::test]
async fn missing_output_directory_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let executor = kube_executor().with("kubelet", Behavior::NoOutput);
    let orchestrator = RunOrchestrator::new(Arc::new(executor), Arc::new(FakeTooling), &config);

    let (summary, _) = run(&orchestrator, &plan(kube_jobs())).await;

    assert!(matches!(
        status_of(&summary, "kubelet"),
        BuildStatus::Failed { message } if message.contains("not produced")
    ));
    assert!(matches!(summary.publish, PublishState::Blocked { .. }));
}

#[tokio::test]
async fn barrier_timeout_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.run.barrier_timeout = Duration::from_millis(200);
    let executor = kube_executor().with("kubeadm", Behavior::Hang);
    let orchestrator = RunOrchestrator::new(Arc::new(executor), Arc::new(FakeTooling), &config);

    let (summary, _) = run(&orchestrator, &plan(kube_jobs())).await;

    assert_eq!(summary.aborted, Some(AbortReason::BarrierTimeout));
    assert_eq!(summary.into_result(), Err(RunError::BarrierTimeout));
    assert_eq!(
        summary.publish,
        PublishState::Aborted {
            reason: AbortReason::BarrierTimeout
        }
    );
    assert!(status_of(&summary, "kubelet").is_success());
    assert!(matches!(status_of(&summary, "kubeadm"), BuildStatus::Failed { .. }));
    assert!(summary.jobs.iter().all(|j| j.status.is_terminal()));
}

#[tokio::test]
async fn run_timeout_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.run.run_timeout = Some(Duration::from_millis(200));
    let registry = Arc::new(MemoryRegistry::new());
    let executor = kube_executor().with("kubeadm", Behavior::Hang);
    let orchestrator = RunOrchestrator::new(Arc::new(executor), Arc::new(FakeTooling), &config)
        .with_registry(registry.clone(), RegistryConfig::new("memory://", "acme"));

    let started = std::time::Instant::now();
    let (summary, events) = run(&orchestrator, &plan(kube_jobs())).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.aborted, Some(AbortReason::RunTimeout));
    assert_eq!(summary.into_result(), Err(RunError::RunTimeout));
    assert_eq!(
        summary.publish,
        PublishState::Aborted {
            reason: AbortReason::RunTimeout
        }
    );
    assert!(status_of(&summary, "kubelet").is_success());
    assert!(matches!(
        status_of(&summary, "kubeadm"),
        BuildStatus::Failed { message } if message.contains("run timeout")
    ));
    assert!(!events.iter().any(|e| matches!(e, RunEvent::PublishStarted)));
    assert!(registry.uploads().is_empty());
}

#[tokio::test]
async fn external_abort_cancels_running_and_queued_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.run.workers = Some(1);
    let executor = ScriptedExecutor::default()
        .with("kubelet", Behavior::Hang)
        .with("kubeadm", Behavior::Hang)
        .with("cri-tools", Behavior::Hang);
    let orchestrator = RunOrchestrator::new(Arc::new(executor), Arc::new(FakeTooling), &config);
    let abort = orchestrator.abort_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort.abort(AbortReason::External);
    });
    let (summary, events) = run(&orchestrator, &plan(kube_jobs())).await;

    assert_eq!(summary.aborted, Some(AbortReason::External));
    assert_eq!(summary.failed(), 3);
    assert!(matches!(summary.publish, PublishState::Aborted { .. }));
    assert!(matches!(
        status_of(&summary, "cri-tools"),
        BuildStatus::Failed { message } if message.contains("cancelled before start")
    ));
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunCompleted { success: false })
    ));
}

#[tokio::test]
async fn job_timeout_fails_only_that_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.run.job_timeout = Some(Duration::from_millis(100));
    let executor = kube_executor().with("kubeadm", Behavior::Hang);
    let orchestrator = RunOrchestrator::new(Arc::new(executor), Arc::new(FakeTooling), &config);

    let (summary, _) = run(&orchestrator, &plan(kube_jobs())).await;

    assert_eq!(summary.aborted, None);
    assert_eq!(summary.succeeded(), 2);
    assert!(matches!(
        status_of(&summary, "kubeadm"),
        BuildStatus::Failed { message } if message.contains("exceeded")
    ));
    assert!(matches!(summary.publish, PublishState::Blocked { .. }));
}

#[tokio::test]
async fn worker_capacity_limits_concurrent_builds() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.run.workers = Some(2);
    let executor = Arc::new(kube_executor().with_delay(Duration::from_millis(50)));
    let orchestrator = RunOrchestrator::new(executor.clone(), Arc::new(FakeTooling), &config);

    let (summary, _) = run(&orchestrator, &plan(kube_jobs())).await;

    assert!(summary.success);
    assert!(executor.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn unversioned_artifact_is_excluded_without_failing_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let executor = kube_executor().with(
        "kubelet",
        Behavior::Write(vec!["kubelet_1.32.2_amd64.deb", "kubelet-tools_latest_all.deb"]),
    );
    let jobs = vec![
        JobSpec::new("kubelet", PackageType::Deb, "make kubelet"),
        JobSpec::new("kubeadm", PackageType::Deb, "make kubeadm"),
    ];
    let orchestrator = RunOrchestrator::new(Arc::new(executor), Arc::new(FakeTooling), &config);

    let (summary, events) = run(&orchestrator, &plan(jobs)).await;

    assert!(summary.success);
    assert_eq!(summary.artifacts.len(), 2);
    assert_eq!(summary.excluded.len(), 1);
    assert_eq!(summary.excluded[0].file, "kubelet-tools_latest_all.deb");
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::ArtifactExcluded { file, .. } if file == "kubelet-tools_latest_all.deb"
    )));
    // Without a registry the run stops after metadata generation.
    assert!(summary.records.is_empty());
    assert_eq!(summary.indexes.len(), 1);
}

#[tokio::test]
async fn duplicate_file_names_across_jobs_are_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let executor = ScriptedExecutor::default()
        .with("kubelet", Behavior::Write(vec!["shared_1.0.0_all.deb"]))
        .with("kubeadm", Behavior::Write(vec!["shared_1.0.0_all.deb"]));
    let jobs = vec![
        JobSpec::new("kubelet", PackageType::Deb, "make kubelet"),
        JobSpec::new("kubeadm", PackageType::Deb, "make kubeadm"),
    ];
    let orchestrator = RunOrchestrator::new(Arc::new(executor), Arc::new(FakeTooling), &config);

    let (summary, _) = run(&orchestrator, &plan(jobs)).await;

    assert_eq!(summary.artifacts.len(), 1);
    assert_eq!(summary.artifacts[0].component_name, "kubelet");
    assert_eq!(summary.excluded.len(), 1);
    assert_eq!(summary.excluded[0].job, "kubeadm");
}

#[tokio::test]
async fn run_directory_holds_jobs_and_repositories() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let orchestrator = RunOrchestrator::new(Arc::new(kube_executor()), Arc::new(FakeTooling), &config);

    let (summary, _) = run(&orchestrator, &plan(kube_jobs())).await;

    assert_eq!(summary.run_dir, dir.path().join(summary.run_id.to_string()));
    assert!(summary.run_dir.join("jobs/kubelet/out/kubelet_1.32.2_amd64.deb").is_file());
    assert!(summary.run_dir.join("collected/kubelet_1.32.2_amd64.deb").is_file());
    assert!(summary.run_dir.join("repo/deb/dists/stable/Release").is_file());
    assert!(summary.run_dir.join("repo/rpm/repodata/repomd.xml").is_file());
}
