//! Per-task pipeline: decide, execute, record

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::cache::{CacheBundle, PutOutcome};
use crate::context::BuildContext;
use crate::decision::{evaluate, Decision, EvaluateOptions, Evaluation};
use crate::fingerprint::{Fingerprint, TaskFingerprint};
use crate::history::ExecutionRecord;
use crate::reporter::{TaskEvent, TaskReporter};
use crate::scheduler::ExecutionOutcome;
use crate::task::{Task, TaskContext};

/// Everything a worker needs to take one task to a terminal state
pub(crate) struct TaskJob {
    pub task: Arc<Task>,
    pub ctx: BuildContext,
    pub reporter: Arc<dyn TaskReporter>,
    pub options: EvaluateOptions,
    pub cancelled: Arc<AtomicBool>,
}

/// Run the pipeline for one task. Never panics outward; a panicking action
/// becomes a failed outcome.
pub(crate) async fn run_task(job: TaskJob) -> (ExecutionOutcome, Duration) {
    let start = Instant::now();
    let TaskJob {
        task,
        ctx,
        reporter,
        options,
        cancelled,
    } = job;

    reporter.report(&TaskEvent::Started {
        id: task.id.clone(),
        action: task.action.describe(),
    });

    let evaluation = {
        let blocking_task = task.clone();
        let blocking_ctx = ctx.clone();
        match tokio::task::spawn_blocking(move || evaluate(&blocking_task, &blocking_ctx, options)).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                let message = format!("up-to-date check panicked: {}", e);
                return fail(&task, &ctx, &*reporter, start, message, options.dry_run).await;
            }
        }
    };

    reporter.report(&TaskEvent::Decided {
        id: task.id.clone(),
        decision: evaluation.decision.clone(),
    });

    let outcome = match evaluation.decision {
        Decision::Skip => ExecutionOutcome::UpToDate,
        Decision::Restore(_) => {
            if !options.dry_run {
                record_restore(&task, &ctx, evaluation).await;
            }
            ExecutionOutcome::FromCache
        }
        Decision::Run(_) if options.dry_run => ExecutionOutcome::WouldRun,
        Decision::Run(_) => {
            let task_ctx = TaskContext::new(&task, ctx.root(), cancelled);
            let action = task.action.clone();
            let handle = tokio::spawn(async move { action.execute(&task_ctx).await });

            match handle.await {
                Ok(Ok(())) => {
                    record_success(&task, &ctx, evaluation.fingerprint, options.use_cache).await;
                    ExecutionOutcome::Executed
                }
                Ok(Err(e)) => {
                    return fail(&task, &ctx, &*reporter, start, e.to_string(), false).await;
                }
                Err(e) => {
                    let message = if e.is_panic() {
                        "action panicked".to_string()
                    } else {
                        format!("action was aborted: {}", e)
                    };
                    return fail(&task, &ctx, &*reporter, start, message, false).await;
                }
            }
        }
    };

    let duration = start.elapsed();
    reporter.report(&TaskEvent::Completed {
        id: task.id.clone(),
        duration,
        outcome: outcome.clone(),
    });
    (outcome, duration)
}

async fn fail(
    task: &Arc<Task>,
    ctx: &BuildContext,
    reporter: &dyn TaskReporter,
    start: Instant,
    message: String,
    dry_run: bool,
) -> (ExecutionOutcome, Duration) {
    if !dry_run {
        let task = task.clone();
        let ctx = ctx.clone();
        let marked = tokio::task::spawn_blocking(move || ctx.history().mark_failed(&task.id)).await;
        match marked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "could not mark execution history as failed"),
            Err(e) => warn!(error = %e, "history update panicked"),
        }
    }

    let duration = start.elapsed();
    reporter.report(&TaskEvent::Failed {
        id: task.id.clone(),
        duration,
        error: message.clone(),
    });
    (ExecutionOutcome::Failed(message), duration)
}

/// Store the fingerprints of a restored task so the next build can skip it
async fn record_restore(task: &Arc<Task>, ctx: &BuildContext, evaluation: Evaluation) {
    let (Some(fingerprint), Some(outputs)) = (evaluation.fingerprint, evaluation.output_fingerprint) else {
        return;
    };
    let task = task.clone();
    let ctx = ctx.clone();
    let stored = tokio::task::spawn_blocking(move || {
        ctx.history().store(&execution_record(&task, fingerprint, outputs))
    })
    .await;
    match stored {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "could not record restored task"),
        Err(e) => warn!(error = %e, "history update panicked"),
    }
}

/// Fingerprint produced outputs, update history and populate the cache
async fn record_success(
    task: &Arc<Task>,
    ctx: &BuildContext,
    fingerprint: Option<TaskFingerprint>,
    use_cache: bool,
) {
    let task = task.clone();
    let ctx = ctx.clone();
    let result = tokio::task::spawn_blocking(move || {
        let Some(fingerprint) = fingerprint else {
            // Inputs could not be fingerprinted; a stale record must not let the next build skip
            if let Err(e) = ctx.history().remove(&task.id) {
                warn!(task = %task.id, error = %e, "could not clear execution history");
            }
            return;
        };

        let outputs = match ctx.fingerprinter().fingerprint_outputs(&task.outputs) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(task = %task.id, error = %e, "could not fingerprint outputs, history not recorded");
                if let Err(e) = ctx.history().remove(&task.id) {
                    warn!(task = %task.id, error = %e, "could not clear execution history");
                }
                return;
            }
        };

        if use_cache && task.is_cacheable() {
            if let Some(cache) = ctx.cache() {
                let bundle = CacheBundle {
                    task_id: task.id.clone(),
                    root: ctx.root().to_path_buf(),
                    outputs: task.outputs.iter().map(|o| o.path().to_path_buf()).collect(),
                    output_fingerprint: outputs.clone(),
                };
                match cache.put(&fingerprint.cache_key, &bundle) {
                    Ok(PutOutcome::Stored) => debug!(task = %task.id, "outputs cached"),
                    Ok(PutOutcome::AlreadyPresent) => {}
                    Err(e) => warn!(task = %task.id, error = %e, "could not store outputs in cache"),
                }
            }
        }

        if let Err(e) = ctx.history().store(&execution_record(&task, fingerprint, outputs)) {
            error!(task = %task.id, error = %e, "could not record execution history");
        }
    })
    .await;

    if let Err(e) = result {
        warn!(error = %e, "recording task results panicked");
    }
}

fn execution_record(task: &Task, fingerprint: TaskFingerprint, outputs: Fingerprint) -> ExecutionRecord {
    ExecutionRecord {
        task_id: task.id.clone(),
        cache_key: fingerprint.cache_key,
        implementation: fingerprint.implementation,
        input_fingerprint: fingerprint.inputs,
        output_fingerprint: outputs,
        success: true,
        recorded_at: chrono::Utc::now().to_rfc3339(),
    }
}
