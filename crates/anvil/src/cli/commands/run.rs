//! Run command: execute tasks and their dependencies

use std::sync::Arc;

use clap::Args;
use console::style;
use tracing::info;

use anvil_tasks::{
    run_graph, BuildRequest, BuildResult, Decision, FailureMode, TaskEvent, TaskReporter, TracingReporter,
};

use super::task_ids;
use crate::cli::output;
use crate::cli::{Cli, OutputFormat, Project};
use crate::exit_codes;

/// Run tasks and everything they depend on
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Tasks to run (all configured tasks when omitted)
    pub tasks: Vec<String>,

    /// Maximum concurrent tasks
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,

    /// Stop dispatching new tasks after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Disable the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Decide what would run without running anything
    #[arg(long)]
    pub dry_run: bool,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<i32> {
        let project = Project::load()?;
        let graph = project.graph()?;

        let build_config = &project.config.build;
        let mut request = BuildRequest::new(task_ids(&self.tasks))
            .with_failure_mode(if self.fail_fast || build_config.fail_fast {
                FailureMode::FailFast
            } else {
                FailureMode::FailAtEnd
            })
            .with_cache(!self.no_cache && project.config.cache.enabled)
            .with_dry_run(self.dry_run);
        if let Some(parallelism) = self.parallelism.or(build_config.parallelism) {
            request = request.with_parallelism(parallelism);
        }
        let ctx = project.context(request.use_cache);

        info!(
            root = %project.root.display(),
            config = ?project.config_path,
            tasks = ?self.tasks,
            parallelism = request.parallelism,
            "starting run"
        );

        let reporter: Arc<dyn TaskReporter> = if cli.show_progress() {
            Arc::new(ConsoleReporter::new(cli.verbose))
        } else {
            Arc::new(TracingReporter)
        };

        if cli.show_progress() && self.dry_run {
            println!("{}", style("[DRY RUN - no tasks will be executed]").yellow().bold());
        }

        let result = tokio::select! {
            result = run_graph(&graph, &request, &ctx, reporter) => result?,
            _ = tokio::signal::ctrl_c() => {
                output::warning("Interrupted, stopping running tasks");
                return Ok(exit_codes::CANCELLED);
            }
        };

        if cli.format == OutputFormat::Json {
            print_json(&result)?;
        } else if !cli.quiet {
            print_failures(&result);
        }

        Ok(result.exit_code())
    }
}

fn print_json(result: &BuildResult) -> anyhow::Result<()> {
    let summary = serde_json::json!({
        "success": result.is_success(),
        "duration_ms": result.duration.as_millis(),
        "summary": result.summary,
        "tasks": result.results.iter().map(|r| {
            serde_json::json!({
                "id": r.id,
                "outcome": r.outcome,
                "duration_ms": r.duration.as_millis(),
            })
        }).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn print_failures(result: &BuildResult) {
    let summary = &result.summary;
    if summary.is_success() {
        return;
    }

    if !summary.failed.is_empty() {
        println!();
        println!(
            "  {} {} failed:",
            style("✗").red().bold(),
            output::plural(summary.failed.len(), "task")
        );
        for failed in &summary.failed {
            println!("    {} {}: {}", style("✗").red(), failed.id, failed.error);
        }
    }
    if !summary.skipped_upstream.is_empty() {
        println!(
            "  {} skipped because an upstream task failed: {}",
            style("○").yellow(),
            join(&summary.skipped_upstream)
        );
    }
    if !summary.not_attempted.is_empty() {
        println!(
            "  {} not attempted (fail-fast): {}",
            style("○").yellow(),
            join(&summary.not_attempted)
        );
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Console reporter with live progress
struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { id, action } => {
                if self.verbose {
                    println!(
                        "  {} {} {}",
                        style("▸").dim(),
                        style(id).bold(),
                        style(format!("({})", action)).dim()
                    );
                }
            }
            TaskEvent::Decided { id, decision } => {
                if let (true, Decision::Run(reason)) = (self.verbose, decision) {
                    println!("    {} {}", style(format!("[{}]", id)).dim(), style(reason).dim());
                }
            }
            TaskEvent::Completed {
                id,
                duration,
                outcome,
            } => {
                let label = match outcome {
                    anvil_tasks::ExecutionOutcome::Executed => String::new(),
                    other => style(format!("({})", other.label())).cyan().to_string(),
                };
                println!(
                    "  {} {} {} {}",
                    style("✓").green(),
                    style(id).green(),
                    label,
                    style(output::seconds(*duration)).dim()
                );
            }
            TaskEvent::Failed {
                id,
                duration,
                error,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(id).red(),
                    style(output::seconds(*duration)).dim(),
                    style(error).red().dim()
                );
            }
            TaskEvent::Skipped { id, reason } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(id).yellow(),
                    style(format!("({})", reason)).dim()
                );
            }
            TaskEvent::AllCompleted { summary, duration } => {
                println!();
                println!(
                    "  {} {} executed, {} up to date, {} from cache, {} failed ({})",
                    if summary.is_success() {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    summary.executed + summary.would_run,
                    summary.up_to_date,
                    summary.from_cache,
                    summary.failed.len(),
                    output::seconds(*duration)
                );
            }
        }
    }
}
