//! Anvil Tasks - Build execution engine
//!
//! This crate builds a task graph from declared dependencies and input/output
//! overlap, fingerprints task inputs and outputs, decides whether each task is
//! up to date, can be restored from the build cache, or must run, and executes
//! the graph with bounded parallelism.

pub mod build;
pub mod cache;
pub mod context;
pub mod decision;
pub mod fingerprint;
pub mod graph;
pub mod history;
pub mod plan;
pub mod reporter;
mod runner;
pub mod scheduler;
pub mod task;

pub use build::{exit_code, run_build, run_graph, BuildError, BuildRequest, BuildResult};
pub use cache::{BuildCache, CacheEntry, CacheError, CacheKey, LocalCache};
pub use context::BuildContext;
pub use decision::{Decision, RunReason};
pub use fingerprint::{Fingerprint, FingerprintError, Fingerprinter};
pub use graph::{CycleError, GraphError, TaskGraph, TaskRegistry};
pub use history::{ExecutionRecord, HistoryError, HistoryStore};
pub use plan::ExecutionPlan;
pub use reporter::{BuildSummary, CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
pub use scheduler::{ExecutionOutcome, FailureMode, SchedulerOptions, TaskResult, TaskScheduler};
pub use task::{
    ActionError, FnAction, InputSpec, Normalization, OutputSpec, Provider, Task, TaskAction, TaskContext,
    TaskDefinition, TaskId,
};
