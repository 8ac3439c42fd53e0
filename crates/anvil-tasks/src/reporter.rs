//! Task execution reporting

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::decision::Decision;
use crate::scheduler::{ExecutionOutcome, TaskResult};
use crate::task::TaskId;

/// Events emitted during a build
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was dispatched to a worker
    Started { id: TaskId, action: String },
    /// The up-to-date check finished
    Decided { id: TaskId, decision: Decision },
    /// A task reached a successful terminal state
    Completed {
        id: TaskId,
        duration: Duration,
        outcome: ExecutionOutcome,
    },
    /// A task's action failed
    Failed {
        id: TaskId,
        duration: Duration,
        error: String,
    },
    /// A task was never dispatched
    Skipped { id: TaskId, reason: String },
    /// The build finished
    AllCompleted {
        summary: BuildSummary,
        duration: Duration,
    },
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { id, action } => {
                tracing::debug!("Starting {}: {}", id, action);
            }
            TaskEvent::Decided { id, decision } => match decision {
                Decision::Skip => tracing::debug!("{} is up to date", id),
                Decision::Restore(entry) => {
                    tracing::debug!("{} restoring from cache entry {}", id, entry.key)
                }
                Decision::Run(reason) => tracing::info!("{} must run: {}", id, reason),
            },
            TaskEvent::Completed {
                id,
                duration,
                outcome,
            } => {
                tracing::info!("{} {} in {:.1}s", id, outcome, duration.as_secs_f64());
            }
            TaskEvent::Failed {
                id,
                duration,
                error,
            } => {
                tracing::error!("{} failed after {:.1}s: {}", id, duration.as_secs_f64(), error);
            }
            TaskEvent::Skipped { id, reason } => {
                tracing::warn!("{} skipped: {}", id, reason);
            }
            TaskEvent::AllCompleted { summary, duration } => {
                tracing::info!(
                    "Build finished in {:.1}s: {} executed, {} up to date, {} from cache, {} failed",
                    duration.as_secs_f64(),
                    summary.executed,
                    summary.up_to_date,
                    summary.from_cache,
                    summary.failed.len()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Ids of started tasks, in dispatch order
    pub fn started(&self) -> Vec<TaskId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Started { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
    }
}

/// Registry of task reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}

/// A failed task and its captured error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub id: TaskId,
    pub error: String,
}

/// Outcome counts for a whole build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub total: usize,
    pub up_to_date: usize,
    pub from_cache: usize,
    pub executed: usize,
    pub would_run: usize,
    pub failed: Vec<FailedTask>,
    /// Skipped because a predecessor failed
    pub skipped_upstream: Vec<TaskId>,
    /// Never dispatched because the build was cancelled
    pub not_attempted: Vec<TaskId>,
}

impl BuildSummary {
    pub fn from_results(results: &[TaskResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match &result.outcome {
                ExecutionOutcome::UpToDate => summary.up_to_date += 1,
                ExecutionOutcome::FromCache => summary.from_cache += 1,
                ExecutionOutcome::Executed => summary.executed += 1,
                ExecutionOutcome::WouldRun => summary.would_run += 1,
                ExecutionOutcome::Failed(error) => summary.failed.push(FailedTask {
                    id: result.id.clone(),
                    error: error.clone(),
                }),
                ExecutionOutcome::SkippedUpstreamFailure => {
                    summary.skipped_upstream.push(result.id.clone())
                }
                ExecutionOutcome::NotAttempted => summary.not_attempted.push(result.id.clone()),
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped_upstream.is_empty() && self.not_attempted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::RunReason;

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();
        let id = TaskId::new("core:build");

        reporter.report(&TaskEvent::Started {
            id: id.clone(),
            action: "cargo build".to_string(),
        });
        reporter.report(&TaskEvent::Completed {
            id: id.clone(),
            duration: Duration::from_secs(5),
            outcome: ExecutionOutcome::Executed,
        });

        assert_eq!(reporter.events().len(), 2);
        assert_eq!(reporter.started(), vec![id]);
    }

    #[test]
    fn test_tracing_reporter() {
        let reporter = TracingReporter;
        let id = TaskId::new("core:build");

        // Just verify it doesn't panic
        reporter.report(&TaskEvent::Decided {
            id: id.clone(),
            decision: Decision::Run(RunReason::NoHistory),
        });
        reporter.report(&TaskEvent::AllCompleted {
            summary: BuildSummary::default(),
            duration: Duration::from_secs(1),
        });
    }

    #[test]
    fn test_broadcast() {
        let collecting = Arc::new(CollectingReporter::default());
        let mut registry = TaskReporterRegistry::empty();
        assert!(registry.all().is_empty());
        registry.register_shared(collecting.clone());
        registry.register(TracingReporter);

        registry.report(&TaskEvent::Skipped {
            id: TaskId::new("lint"),
            reason: "build cancelled".to_string(),
        });

        assert_eq!(registry.all().len(), 2);
        assert_eq!(collecting.events().len(), 1);
    }

    #[test]
    fn test_summary_from_results() {
        let result = |id: &str, outcome| TaskResult {
            id: TaskId::new(id),
            outcome,
            duration: Duration::ZERO,
        };
        let summary = BuildSummary::from_results(&[
            result("a", ExecutionOutcome::Executed),
            result("b", ExecutionOutcome::UpToDate),
            result("c", ExecutionOutcome::FromCache),
            result("d", ExecutionOutcome::Failed("exit 1".to_string())),
            result("e", ExecutionOutcome::SkippedUpstreamFailure),
        ]);

        assert_eq!(summary.total, 5);
        assert_eq!((summary.executed, summary.up_to_date, summary.from_cache), (1, 1, 1));
        assert_eq!(summary.failed[0].error, "exit 1");
        assert_eq!(summary.skipped_upstream, vec![TaskId::new("e")]);
        assert!(!summary.is_success());
        assert!(BuildSummary::default().is_success());
    }
}
