//! Build invocation entry point

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument};

use crate::context::BuildContext;
use crate::graph::{GraphError, TaskGraph, TaskRegistry};
use crate::history::HistoryError;
use crate::reporter::{BuildSummary, TaskReporter};
use crate::scheduler::{
    default_parallelism, ExecutionOutcome, FailureMode, SchedulerOptions, TaskResult, TaskScheduler,
};
use crate::task::TaskId;

/// Process exit codes
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const TASK_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const CYCLE: i32 = 3;
}

/// What to build and how
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Requested tasks; empty means every registered task
    pub tasks: Vec<TaskId>,
    pub parallelism: usize,
    pub failure_mode: FailureMode,
    pub use_cache: bool,
    pub dry_run: bool,
}

impl BuildRequest {
    pub fn new<I, T>(tasks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        Self {
            tasks: tasks.into_iter().map(Into::into).collect(),
            parallelism: default_parallelism(),
            failure_mode: FailureMode::FailAtEnd,
            use_cache: true,
            dry_run: false,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            parallelism: self.parallelism,
            failure_mode: self.failure_mode,
            use_cache: self.use_cache,
            dry_run: self.dry_run,
        }
    }
}

/// Per-task outcomes of a finished build
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub outcomes: BTreeMap<TaskId, ExecutionOutcome>,
    /// Results in plan order
    pub results: Vec<TaskResult>,
    pub summary: BuildSummary,
    pub duration: Duration,
}

impl BuildResult {
    pub fn outcome(&self, id: &str) -> Option<&ExecutionOutcome> {
        self.outcomes.get(&TaskId::new(id))
    }

    pub fn is_success(&self) -> bool {
        self.summary.is_success()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            exit_code::SUCCESS
        } else {
            exit_code::TASK_FAILED
        }
    }
}

/// Errors that abort a build before any task runs
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Execution history store unavailable: {0}")]
    History(#[from] HistoryError),
}

impl BuildError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Graph(GraphError::Cycle(_)) => exit_code::CYCLE,
            _ => exit_code::CONFIG_ERROR,
        }
    }
}

/// Freeze the registry and run a build
pub async fn run_build(
    registry: TaskRegistry,
    request: &BuildRequest,
    ctx: &BuildContext,
    reporter: Arc<dyn TaskReporter>,
) -> Result<BuildResult, BuildError> {
    let graph = registry.freeze()?;
    run_graph(&graph, request, ctx, reporter).await
}

/// Run the requested tasks of an already built graph
#[instrument(skip_all, fields(requested = request.tasks.len()))]
pub async fn run_graph(
    graph: &TaskGraph,
    request: &BuildRequest,
    ctx: &BuildContext,
    reporter: Arc<dyn TaskReporter>,
) -> Result<BuildResult, BuildError> {
    let start = Instant::now();
    let plan = graph.plan(&request.tasks)?;
    if !request.dry_run {
        ctx.history().ensure_writable()?;
    }

    let scheduler = TaskScheduler::new(request.scheduler_options(), reporter);
    let results = scheduler.execute(&plan, ctx).await;

    let summary = BuildSummary::from_results(&results);
    let outcomes = results
        .iter()
        .map(|r| (r.id.clone(), r.outcome.clone()))
        .collect();

    info!(
        tasks = results.len(),
        failed = summary.failed.len(),
        success = summary.is_success(),
        "build complete"
    );

    Ok(BuildResult {
        outcomes,
        results,
        summary,
        duration: start.elapsed(),
    })
}
