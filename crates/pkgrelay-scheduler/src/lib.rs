//! Build scheduling and run orchestration for pkgrelay.
//!
//! Build jobs run concurrently up to the worker capacity. The publish job
//! waits on a [`FanInBarrier`] for every build, then collects artifacts,
//! generates repository metadata and publishes.

pub mod barrier;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod publish;
pub mod registry;

pub use barrier::{BarrierToken, FanInBarrier};
pub use error::{RunError, SchedulerError, SchedulerResult};
pub use graph::{DependencyEdge, DependencyGraph, PUBLISH_JOB};
pub use orchestrator::{PublishState, RunEvent, RunOrchestrator, RunPlan, RunSummary};
pub use publish::{ExcludedArtifact, IndexOutcome};
pub use registry::JobRegistry;
