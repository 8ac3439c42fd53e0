//! History management command

use clap::{Args, Subcommand};
use console::style;

use crate::cli::{Cli, OutputFormat, Project};
use crate::exit_codes;

/// Execution history management
#[derive(Debug, Args)]
pub struct HistoryCommand {
    #[command(subcommand)]
    pub action: HistoryAction,
}

/// History subcommands
#[derive(Debug, Subcommand)]
pub enum HistoryAction {
    /// Forget recorded executions so every task runs again
    Clear(HistoryClearCommand),
}

/// Forget recorded executions
#[derive(Debug, Args)]
pub struct HistoryClearCommand {
    /// Only forget these tasks
    pub tasks: Vec<String>,
}

impl HistoryCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        match &self.action {
            HistoryAction::Clear(cmd) => cmd.execute(cli),
        }
    }
}

impl HistoryClearCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let project = Project::load()?;
        let history = project.history();

        let removed = if self.tasks.is_empty() {
            history.clear()?
        } else {
            for id in super::task_ids(&self.tasks) {
                history.remove(&id)?;
            }
            self.tasks.len()
        };

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "removed": removed,
                "history_dir": history.dir().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "{} Cleared {} at {}",
                style("✓").green(),
                crate::cli::output::plural(removed, "record"),
                style(history.dir().display()).cyan()
            );
        }

        Ok(exit_codes::SUCCESS)
    }
}
