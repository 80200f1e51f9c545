//! Run orchestrator - builds every job, waits on the fan-in barrier, then
//! runs the publish job.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use pkgrelay_config::{ParameterContext, ProjectConfig, RegistryConfig, RepositoryConfig, RunConfig};
use pkgrelay_core::executor::{BuildExecutor, BuildRequest};
use pkgrelay_core::job::safe_name;
use pkgrelay_core::registry::RegistryClient;
use pkgrelay_core::{
    AbortHandle, AbortReason, Artifact, BuildResult, BuildStatus, Error, JobSpec, PackageType,
    PublishRecord, PublishStatus, RunId,
};
use pkgrelay_repo::IndexTooling;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::barrier::{BarrierToken, FanInBarrier};
use crate::graph::{DependencyGraph, PUBLISH_JOB};
use crate::publish::{self, ExcludedArtifact, IndexOutcome};
use crate::registry::JobRegistry;
use crate::{RunError, SchedulerResult};

/// How long aborted jobs get to wind down before they are marked failed.
const ABORT_GRACE: Duration = Duration::from_secs(30);

/// A validated job table and its fan-in graph.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub jobs: JobRegistry,
    pub graph: DependencyGraph,
}

impl RunPlan {
    pub fn new(jobs: JobRegistry) -> SchedulerResult<Self> {
        let graph = DependencyGraph::fan_in(&jobs)?;
        Ok(Self { jobs, graph })
    }

    pub fn from_config(config: &ProjectConfig) -> SchedulerResult<Self> {
        Self::new(JobRegistry::from_config(config)?)
    }

    /// Jobs the publish job waits on, in declaration order.
    pub fn fan_in_jobs(&self) -> Vec<&JobSpec> {
        fan_in_jobs(&self.jobs, &self.graph)
    }

    /// Package types the jobs declare.
    pub fn package_types(&self) -> BTreeSet<PackageType> {
        self.jobs.jobs().iter().map(|j| j.package_type).collect()
    }
}

fn fan_in_jobs<'a>(jobs: &'a JobRegistry, graph: &DependencyGraph) -> Vec<&'a JobSpec> {
    let deps: BTreeSet<&str> = graph.dependencies_of(PUBLISH_JOB).collect();
    jobs.jobs()
        .iter()
        .filter(|job| deps.contains(job.name.as_str()))
        .collect()
}

/// State of the publish job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PublishState {
    Waiting,
    /// A build failed; publishing never started.
    Blocked { failed: Vec<String> },
    Running,
    Succeeded,
    Failed { reason: String },
    Aborted { reason: AbortReason },
}

impl PublishState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PublishState::Waiting | PublishState::Running)
    }

    /// Move to `next`. Terminal states are final and `Running` is only
    /// entered from `Waiting`.
    fn advance(&mut self, next: PublishState) {
        let allowed = match (&*self, &next) {
            (PublishState::Waiting, _) => true,
            (PublishState::Running, next) => next.is_terminal(),
            _ => false,
        };
        if allowed {
            debug!(from = ?self, to = ?next, "Publish state");
            *self = next;
        } else {
            warn!(from = ?self, to = ?next, "Invalid publish state transition");
        }
    }
}

/// Event emitted during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    JobStarted { job: String },
    JobFinished { job: String, status: BuildStatus },
    PublishBlocked { failed: Vec<String> },
    PublishStarted,
    ArtifactExcluded { file: String, reason: String },
    IndexGenerated { package_type: PackageType, package_count: usize },
    IndexFailed { package_type: PackageType, error: String },
    Published { record: PublishRecord },
    RunCompleted { success: bool },
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub success: bool,
    /// Build results in job declaration order.
    pub jobs: Vec<BuildResult>,
    pub publish: PublishState,
    pub artifacts: Vec<Artifact>,
    pub excluded: Vec<ExcludedArtifact>,
    pub indexes: Vec<IndexOutcome>,
    pub records: Vec<PublishRecord>,
    pub aborted: Option<AbortReason>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|j| j.status.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| matches!(j.status, BuildStatus::Failed { .. }))
            .count()
    }

    pub fn published(&self) -> usize {
        self.count(PublishStatus::Published)
    }

    pub fn count(&self, status: PublishStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// `Ok` only when the publish job succeeded.
    pub fn into_result(&self) -> Result<(), RunError> {
        match &self.publish {
            PublishState::Succeeded => Ok(()),
            PublishState::Blocked { failed } => Err(RunError::BuildsFailed(failed.clone())),
            PublishState::Failed { reason } => Err(RunError::PublishFailed(reason.clone())),
            PublishState::Aborted { reason } => Err(match reason {
                AbortReason::BarrierTimeout => RunError::BarrierTimeout,
                AbortReason::RunTimeout => RunError::RunTimeout,
                other => RunError::Aborted(*other),
            }),
            PublishState::Waiting | PublishState::Running => {
                Err(RunError::PublishFailed("publish job did not finish".to_string()))
            }
        }
    }
}

/// Shared state of one run.
pub(crate) struct RunContext {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub jobs: JobRegistry,
    pub graph: DependencyGraph,
    pub package_types: BTreeSet<PackageType>,
    pub executor: Arc<dyn BuildExecutor>,
    pub tooling: Arc<dyn IndexTooling>,
    pub registry: Option<(Arc<dyn RegistryClient>, RegistryConfig)>,
    pub run: RunConfig,
    pub repository: RepositoryConfig,
    pub abort: AbortHandle,
    pub tx: mpsc::Sender<RunEvent>,
}

impl RunContext {
    pub async fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Orchestrates build jobs and the publish job.
pub struct RunOrchestrator {
    executor: Arc<dyn BuildExecutor>,
    tooling: Arc<dyn IndexTooling>,
    registry: Option<(Arc<dyn RegistryClient>, RegistryConfig)>,
    run: RunConfig,
    repository: RepositoryConfig,
    abort: AbortHandle,
}

impl RunOrchestrator {
    pub fn new(
        executor: Arc<dyn BuildExecutor>,
        tooling: Arc<dyn IndexTooling>,
        config: &ProjectConfig,
    ) -> Self {
        Self {
            executor,
            tooling,
            registry: None,
            run: config.run.clone(),
            repository: config.repository.clone(),
            abort: AbortHandle::new(),
        }
    }

    /// Publish through `client`. Without a registry, runs stop after
    /// metadata generation.
    pub fn with_registry(mut self, client: Arc<dyn RegistryClient>, config: RegistryConfig) -> Self {
        self.registry = Some((client, config));
        self
    }

    /// Use an externally owned abort handle.
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Execute a run, returning a channel of events and a handle to get the
    /// final summary.
    pub fn execute(
        &self,
        plan: &RunPlan,
    ) -> (mpsc::Receiver<RunEvent>, tokio::task::JoinHandle<RunSummary>) {
        let (tx, rx) = mpsc::channel(100);
        let run_id = RunId::new();
        let ctx = Arc::new(RunContext {
            run_id,
            run_dir: self.run.work_dir.join(run_id.to_string()),
            jobs: plan.jobs.clone(),
            graph: plan.graph.clone(),
            package_types: plan.package_types(),
            executor: self.executor.clone(),
            tooling: self.tooling.clone(),
            registry: self.registry.clone(),
            run: self.run.clone(),
            repository: self.repository.clone(),
            abort: self.abort.clone(),
            tx,
        });

        let handle = tokio::spawn(Self::execute_inner(ctx));
        (rx, handle)
    }

    async fn execute_inner(ctx: Arc<RunContext>) -> RunSummary {
        let started_at = Utc::now();
        info!(run_id = %ctx.run_id, jobs = ctx.jobs.len(), dir = %ctx.run_dir.display(), "Starting run");

        let watchdog = ctx.run.run_timeout.map(|limit| {
            let abort = ctx.abort.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(timeout_secs = limit.as_secs(), "Run timeout reached");
                abort.abort(AbortReason::RunTimeout);
            })
        });

        let jobs = Self::build_phase(&ctx).await;

        let failed: Vec<String> = jobs
            .iter()
            .filter(|j| !j.status.is_success())
            .map(|j| j.job_name.clone())
            .collect();

        let mut outcome = publish::PublishOutcome::default();
        let mut publish = PublishState::Waiting;
        if let Some(reason) = ctx.abort.signal().reason() {
            error!(%reason, "Run aborted, not publishing");
            publish.advance(PublishState::Aborted { reason });
        } else if !failed.is_empty() {
            warn!(?failed, "Publish blocked by failed builds");
            ctx.emit(RunEvent::PublishBlocked {
                failed: failed.clone(),
            })
            .await;
            publish.advance(PublishState::Blocked { failed });
        } else {
            info!("All builds succeeded, publishing");
            publish.advance(PublishState::Running);
            ctx.emit(RunEvent::PublishStarted).await;
            outcome = publish::run(&ctx, &jobs).await;
            publish.advance(match (ctx.abort.signal().reason(), outcome.failure()) {
                (Some(reason), _) => PublishState::Aborted { reason },
                (None, Some(reason)) => PublishState::Failed { reason },
                (None, None) => PublishState::Succeeded,
            });
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let success = publish == PublishState::Succeeded;
        ctx.emit(RunEvent::RunCompleted { success }).await;
        info!(run_id = %ctx.run_id, success, "Run completed");

        RunSummary {
            run_id: ctx.run_id,
            run_dir: ctx.run_dir.clone(),
            success,
            jobs,
            publish,
            artifacts: outcome.artifacts,
            excluded: outcome.excluded,
            indexes: outcome.indexes,
            records: outcome.records,
            aborted: ctx.abort.signal().reason(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Run every build job and wait on the fan-in barrier. Returns the
    /// results in declaration order, all terminal.
    async fn build_phase(ctx: &Arc<RunContext>) -> Vec<BuildResult> {
        let results: Arc<Mutex<BTreeMap<String, BuildResult>>> = Arc::new(Mutex::new(
            ctx.jobs
                .names()
                .map(|name| (name.to_string(), BuildResult::pending(name)))
                .collect(),
        ));
        let builds = fan_in_jobs(&ctx.jobs, &ctx.graph);
        let workers = Arc::new(Semaphore::new(ctx.run.worker_capacity(builds.len())));
        let mut barrier = FanInBarrier::new(builds.len());

        let mut handles = Vec::with_capacity(builds.len());
        for job in builds {
            let Some(token) = barrier.token() else {
                break;
            };
            handles.push(tokio::spawn(Self::run_job(
                ctx.clone(),
                job.clone(),
                token,
                workers.clone(),
                results.clone(),
            )));
        }

        if let Err(remaining) = barrier.wait_timeout(ctx.run.barrier_timeout).await {
            error!(
                remaining,
                timeout_secs = ctx.run.barrier_timeout.as_secs(),
                "Fan-in barrier timed out"
            );
            ctx.abort.abort(AbortReason::BarrierTimeout);
        }

        if tokio::time::timeout(ABORT_GRACE, join_all(handles)).await.is_err() {
            warn!("Build jobs did not stop after abort");
        }

        let mut results = results.lock().await;
        ctx.jobs
            .names()
            .filter_map(|name| results.remove(name))
            .map(|mut result| {
                if !result.status.is_terminal() {
                    let _ = result.fail(format!("did not reach a terminal state before {}", PUBLISH_JOB));
                }
                result
            })
            .collect()
    }

    async fn run_job(
        ctx: Arc<RunContext>,
        job: JobSpec,
        _token: BarrierToken,
        workers: Arc<Semaphore>,
        results: Arc<Mutex<BTreeMap<String, BuildResult>>>,
    ) {
        let signal = ctx.abort.signal();
        let _permit = tokio::select! {
            permit = workers.acquire_owned() => permit.ok(),
            reason = signal.aborted() => {
                Self::finish(&ctx, &results, &job.name, Err(format!("cancelled before start: {}", reason))).await;
                return;
            }
        };
        if let Some(reason) = signal.reason() {
            Self::finish(&ctx, &results, &job.name, Err(format!("cancelled before start: {}", reason))).await;
            return;
        }

        {
            let mut results = results.lock().await;
            if let Some(result) = results.get_mut(&job.name) {
                if let Err(e) = result.transition(BuildStatus::Running) {
                    warn!(job = %job.name, error = %e, "Unexpected job state");
                }
            }
        }
        ctx.emit(RunEvent::JobStarted {
            job: job.name.clone(),
        })
        .await;

        let outcome = Self::build(&ctx, &job).await;
        Self::finish(&ctx, &results, &job.name, outcome).await;
    }

    /// Run one build through the executor and list its packages.
    async fn build(ctx: &RunContext, job: &JobSpec) -> Result<Vec<PathBuf>, String> {
        let job_dir = ctx.run_dir.join("jobs").join(safe_name(&job.name));
        let work_dir = job_dir.join("work");
        let output_dir = job_dir.join("out");

        let mut params = ParameterContext::for_job(job)
            .with_dirs(&work_dir, &output_dir)
            .with_run_id(ctx.run_id);
        params.populate_env();

        let unresolved = params.unresolved(&job.command_template);
        if !unresolved.is_empty() {
            warn!(job = %job.name, ?unresolved, "Command references unknown parameters");
        }

        // Each job gets its own handle so a job timeout stops only that job.
        let job_abort = AbortHandle::new();
        let forward = {
            let run = ctx.abort.signal();
            let job_abort = job_abort.clone();
            tokio::spawn(async move {
                let reason = run.aborted().await;
                job_abort.abort(reason);
            })
        };

        let request = BuildRequest {
            run_id: ctx.run_id,
            job_name: job.name.clone(),
            command: params.interpolate(&job.command_template),
            parameters: params.values().clone(),
            runner: job.runner.clone(),
            work_dir,
            output_dir: output_dir.clone(),
            abort: job_abort.signal(),
        };

        info!(job = %job.name, executor = ctx.executor.name(), "Running build");
        let execution = ctx.executor.execute(request);
        tokio::pin!(execution);
        let result = match ctx.run.job_timeout {
            Some(limit) => tokio::select! {
                result = &mut execution => result,
                _ = tokio::time::sleep(limit) => {
                    job_abort.abort(AbortReason::JobTimeout);
                    let _ = execution.await;
                    Err(Error::Timeout(format!("job exceeded {:?}", limit)))
                }
            },
            None => execution.await,
        };
        forward.abort();

        result.map_err(|e| e.to_string())?;
        collect_packages(&output_dir).await
    }

    async fn finish(
        ctx: &RunContext,
        results: &Mutex<BTreeMap<String, BuildResult>>,
        job_name: &str,
        outcome: Result<Vec<PathBuf>, String>,
    ) {
        let status = {
            let mut results = results.lock().await;
            let Some(result) = results.get_mut(job_name) else {
                return;
            };
            let transition = match outcome {
                Ok(paths) => {
                    info!(job = %job_name, packages = paths.len(), "Build succeeded");
                    result.succeed(paths)
                }
                Err(message) => {
                    error!(job = %job_name, error = %message, "Build failed");
                    result.fail(message)
                }
            };
            if let Err(e) = transition {
                warn!(job = %job_name, error = %e, "Unexpected job state");
            }
            result.status.clone()
        };

        ctx.emit(RunEvent::JobFinished {
            job: job_name.to_string(),
            status,
        })
        .await;
    }
}

/// Package files directly inside `output_dir`, sorted by name. A missing
/// output directory fails the build.
async fn collect_packages(output_dir: &Path) -> Result<Vec<PathBuf>, String> {
    let mut entries = match tokio::fs::read_dir(output_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            return Err(format!(
                "output directory {} not produced: {}",
                output_dir.display(),
                e
            ));
        }
    };

    let mut packages = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && PackageType::from_path(&path).is_some() {
            packages.push(path);
        }
    }
    packages.sort();
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(names: &[&str]) -> RunPlan {
        RunPlan::new(
            JobRegistry::new(
                names
                    .iter()
                    .map(|n| JobSpec::new(*n, PackageType::Deb, "make"))
                    .collect(),
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn names<'a>(jobs: &[&'a JobSpec]) -> Vec<&'a str> {
        jobs.iter().map(|j| j.name.as_str()).collect()
    }

    #[test]
    fn test_fan_in_jobs_are_the_registered_builds() {
        let plan = plan(&["kubelet", "kubeadm", "cert-bundle"]);
        assert_eq!(names(&plan.fan_in_jobs()), vec!["kubelet", "kubeadm", "cert-bundle"]);
        let deps: BTreeSet<&str> = plan.graph.dependencies_of(PUBLISH_JOB).collect();
        assert_eq!(deps, plan.jobs.names().collect::<BTreeSet<_>>());
    }

    #[test]
    fn test_shipped_job_table_plans_a_full_fan_in() {
        let config = pkgrelay_config::parse_config(include_str!("../../../pkgrelay.kdl")).unwrap();
        let plan = RunPlan::from_config(&config).unwrap();
        assert_eq!(plan.jobs.len(), 10);
        assert_eq!(plan.fan_in_jobs().len(), 10);
        assert_eq!(plan.graph.edges().len(), 10);
        assert_eq!(plan.package_types(), BTreeSet::from([PackageType::Deb]));
    }

    #[test]
    fn test_publish_state_transitions() {
        let mut state = PublishState::Waiting;
        state.advance(PublishState::Running);
        assert_eq!(state, PublishState::Running);
        state.advance(PublishState::Aborted { reason: AbortReason::External });
        assert_eq!(state, PublishState::Aborted { reason: AbortReason::External });

        let mut state = PublishState::Waiting;
        state.advance(PublishState::Running);
        state.advance(PublishState::Waiting);
        assert_eq!(state, PublishState::Running);
        state.advance(PublishState::Succeeded);
        state.advance(PublishState::Failed { reason: "late".into() });
        assert_eq!(state, PublishState::Succeeded);
    }

    #[test]
    fn test_fan_in_jobs_follow_the_graph() {
        let mut plan = plan(&["kubelet", "kubeadm"]);
        let mut graph = DependencyGraph::new();
        for name in [PUBLISH_JOB, "kubelet", "kubeadm"] {
            graph.add_node(name);
        }
        graph.add_edge(PUBLISH_JOB, "kubeadm").unwrap();
        plan.graph = graph;
        assert_eq!(names(&plan.fan_in_jobs()), vec!["kubeadm"]);
    }

    #[tokio::test]
    async fn test_collect_packages_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["b_1.0.0_all.deb", "a-1.0.0-1.noarch.rpm", "build.log"] {
            std::fs::write(dir.path().join(file), "x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.deb")).unwrap();

        let packages = collect_packages(dir.path()).await.unwrap();
        let names: Vec<_> = packages
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a-1.0.0-1.noarch.rpm", "b_1.0.0_all.deb"]);
    }

    #[tokio::test]
    async fn test_missing_output_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = collect_packages(&dir.path().join("out")).await.unwrap_err();
        assert!(err.contains("not produced"));
    }
}
