//! Task scheduler: bounded-parallel executor using tokio

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, instrument};

use crate::context::BuildContext;
use crate::decision::EvaluateOptions;
use crate::plan::ExecutionPlan;
use crate::reporter::{BuildSummary, TaskEvent, TaskReporter};
use crate::runner::{run_task, TaskJob};
use crate::task::TaskId;

/// Final outcome of a task in one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Skipped: nothing changed since the last successful run
    UpToDate,
    /// Outputs restored from the build cache
    FromCache,
    /// Action ran and succeeded
    Executed,
    /// Dry run: the action would have run
    WouldRun,
    /// Action ran and failed
    Failed(String),
    /// A predecessor failed
    SkippedUpstreamFailure,
    /// Never dispatched because fail-fast cancelled the build
    NotAttempted,
}

impl ExecutionOutcome {
    /// Check if this outcome counts as success for dependents
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::UpToDate | Self::FromCache | Self::Executed | Self::WouldRun
        )
    }

    /// Whether dependents must treat this task's outputs as changed
    pub fn did_execute(&self) -> bool {
        matches!(self, Self::Executed | Self::WouldRun)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::UpToDate => "up-to-date",
            Self::FromCache => "from-cache",
            Self::Executed => "executed",
            Self::WouldRun => "would-run",
            Self::Failed(_) => "failed",
            Self::SkippedUpstreamFailure => "skipped (upstream failure)",
            Self::NotAttempted => "not attempted",
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "failed: {}", e),
            other => f.write_str(other.label()),
        }
    }
}

/// Result of a single task in a build
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: TaskId,
    pub outcome: ExecutionOutcome,
    pub duration: Duration,
}

/// What happens to independent work after a task fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Let running tasks and unaffected branches finish
    #[default]
    FailAtEnd,
    /// Dispatch nothing new after the first failure
    FailFast,
}

/// Options for the task scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrently running tasks
    pub parallelism: usize,
    pub failure_mode: FailureMode,
    /// Whether to restore from and populate the build cache
    pub use_cache: bool,
    /// Decide only; nothing is executed, restored or recorded
    pub dry_run: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            failure_mode: FailureMode::FailAtEnd,
            use_cache: true,
            dry_run: false,
        }
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Scheduling state of one task
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskState {
    Pending,
    Ready,
    Running,
    Done(ExecutionOutcome),
}

/// Mutable bookkeeping owned by the coordinator
struct Coordinator<'a> {
    plan: &'a ExecutionPlan,
    states: Vec<TaskState>,
    /// Predecessors not yet finished
    remaining: Vec<usize>,
    upstream_executed: Vec<bool>,
    ready: Vec<usize>,
    running: Vec<usize>,
    durations: Vec<Duration>,
}

impl<'a> Coordinator<'a> {
    fn new(plan: &'a ExecutionPlan) -> Self {
        let n = plan.len();
        let remaining: Vec<usize> = (0..n).map(|i| plan.dependencies(i).len()).collect();
        let mut states = vec![TaskState::Pending; n];
        let mut ready = Vec::new();
        for (i, count) in remaining.iter().enumerate() {
            if *count == 0 {
                states[i] = TaskState::Ready;
                ready.push(i);
            }
        }
        Self {
            plan,
            states,
            remaining,
            upstream_executed: vec![false; n],
            ready,
            running: Vec::new(),
            durations: vec![Duration::ZERO; n],
        }
    }

    fn pending_dependents(&self, idx: usize) -> usize {
        self.plan
            .dependents(idx)
            .iter()
            .filter(|&&d| self.states[d] == TaskState::Pending)
            .count()
    }

    fn conflicts_with_running(&self, idx: usize) -> bool {
        let task = self.plan.task(idx);
        self.running
            .iter()
            .any(|&r| task.outputs_overlap(self.plan.task(r)))
    }

    /// Next ready task: most pending dependents first, then declaration order,
    /// excluding tasks whose outputs overlap a running task
    fn pick(&self) -> Option<usize> {
        self.ready
            .iter()
            .copied()
            .filter(|&i| !self.conflicts_with_running(i))
            .min_by_key(|&i| (std::cmp::Reverse(self.pending_dependents(i)), i))
    }

    fn start(&mut self, idx: usize) {
        self.ready.retain(|&r| r != idx);
        self.running.push(idx);
        self.states[idx] = TaskState::Running;
    }

    /// Record a finished task and return dependents skipped because of it
    fn finish(&mut self, idx: usize, outcome: ExecutionOutcome, duration: Duration) -> Vec<usize> {
        self.running.retain(|&r| r != idx);
        self.durations[idx] = duration;

        let mut skipped = Vec::new();
        if outcome.is_success() {
            for &dep in self.plan.dependents(idx) {
                if outcome.did_execute() {
                    self.upstream_executed[dep] = true;
                }
                self.remaining[dep] -= 1;
                if self.remaining[dep] == 0 && self.states[dep] == TaskState::Pending {
                    self.states[dep] = TaskState::Ready;
                    self.ready.push(dep);
                }
            }
        } else {
            let mut stack = vec![idx];
            while let Some(current) = stack.pop() {
                for &dep in self.plan.dependents(current) {
                    if self.states[dep] == TaskState::Pending {
                        self.states[dep] = TaskState::Done(ExecutionOutcome::SkippedUpstreamFailure);
                        skipped.push(dep);
                        stack.push(dep);
                    }
                }
            }
        }

        self.states[idx] = TaskState::Done(outcome);
        skipped
    }
}

type WorkerResult = (usize, ExecutionOutcome, Duration);

/// Map a joined worker back to its task. A worker that died is a failure of
/// the task it was running.
fn worker_result(
    joined: Result<(Id, WorkerResult), JoinError>,
    in_flight: &mut HashMap<Id, usize>,
) -> Option<WorkerResult> {
    match joined {
        Ok((id, result)) => {
            in_flight.remove(&id);
            Some(result)
        }
        Err(e) => {
            error!(error = %e, "worker failed unexpectedly");
            let idx = in_flight.remove(&e.id())?;
            Some((
                idx,
                ExecutionOutcome::Failed(format!("worker failed: {}", e)),
                Duration::ZERO,
            ))
        }
    }
}

/// Task scheduler: executes an [`ExecutionPlan`] with bounded parallelism
pub struct TaskScheduler {
    options: SchedulerOptions,
    reporter: Arc<dyn TaskReporter>,
}

impl TaskScheduler {
    pub fn new(options: SchedulerOptions, reporter: Arc<dyn TaskReporter>) -> Self {
        Self { options, reporter }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Execute every task in the plan. Results are returned in plan order.
    ///
    /// A single coordinator owns all scheduling state; workers only run the
    /// per-task pipeline and report back through the join set.
    #[instrument(skip_all, fields(tasks = plan.len(), parallelism = self.options.parallelism))]
    pub async fn execute(&self, plan: &ExecutionPlan, ctx: &BuildContext) -> Vec<TaskResult> {
        let start = Instant::now();
        let parallelism = self.options.parallelism.max(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut coordinator = Coordinator::new(plan);
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut in_flight: HashMap<Id, usize> = HashMap::new();

        info!(
            tasks = plan.len(),
            parallelism,
            dry_run = self.options.dry_run,
            "starting build"
        );

        loop {
            while workers.len() < parallelism && !cancelled.load(Ordering::SeqCst) {
                let Some(idx) = coordinator.pick() else {
                    break;
                };
                coordinator.start(idx);
                debug!(task = %plan.task(idx).id, "dispatching");

                let job = TaskJob {
                    task: plan.task(idx).clone(),
                    ctx: ctx.clone(),
                    reporter: self.reporter.clone(),
                    options: EvaluateOptions {
                        upstream_executed: coordinator.upstream_executed[idx],
                        use_cache: self.options.use_cache,
                        dry_run: self.options.dry_run,
                    },
                    cancelled: cancelled.clone(),
                };
                let handle = workers.spawn(async move {
                    // The pipeline runs as its own task so a panic is contained
                    let (outcome, duration) = match tokio::spawn(run_task(job)).await {
                        Ok(result) => result,
                        Err(e) => (
                            ExecutionOutcome::Failed(format!("task pipeline panicked: {}", e)),
                            Duration::ZERO,
                        ),
                    };
                    (idx, outcome, duration)
                });
                in_flight.insert(handle.id(), idx);
            }

            let Some(joined) = workers.join_next_with_id().await else {
                break;
            };
            let Some((idx, outcome, duration)) = worker_result(joined, &mut in_flight) else {
                continue;
            };

            if matches!(outcome, ExecutionOutcome::Failed(_))
                && self.options.failure_mode == FailureMode::FailFast
                && !cancelled.swap(true, Ordering::SeqCst)
            {
                info!(task = %plan.task(idx).id, "task failed, cancelling remaining work");
            }

            for skipped in coordinator.finish(idx, outcome, duration) {
                self.reporter.report(&TaskEvent::Skipped {
                    id: plan.task(skipped).id.clone(),
                    reason: format!("upstream task {} failed", plan.task(idx).id),
                });
            }
        }

        let mut results = Vec::with_capacity(plan.len());
        for (idx, state) in coordinator.states.iter().enumerate() {
            let id = plan.task(idx).id.clone();
            let outcome = match state {
                TaskState::Done(outcome) => outcome.clone(),
                _ => {
                    self.reporter.report(&TaskEvent::Skipped {
                        id: id.clone(),
                        reason: "build cancelled".to_string(),
                    });
                    ExecutionOutcome::NotAttempted
                }
            };
            results.push(TaskResult {
                id,
                outcome,
                duration: coordinator.durations[idx],
            });
        }

        let summary = BuildSummary::from_results(&results);
        self.reporter.report(&TaskEvent::AllCompleted {
            summary,
            duration: start.elapsed(),
        });

        results
    }
}
