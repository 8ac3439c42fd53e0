//! CLI definition and command handling

pub mod commands;
pub mod output;
mod project;
mod shell;

use clap::{Parser, Subcommand};

use commands::{CacheCommand, CompletionsCommand, HistoryCommand, PlanCommand, RunCommand};

pub use project::Project;

/// Anvil - incremental, cache-aware task runner
#[derive(Debug, Parser)]
#[command(name = "anvil")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run tasks and everything they depend on
    Run(RunCommand),

    /// Show the execution plan without running anything
    Plan(PlanCommand),

    /// Build cache management
    Cache(CacheCommand),

    /// Execution history management
    History(HistoryCommand),

    /// Generate shell completions
    Completions(CompletionsCommand),
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub fn execute(&self) -> anyhow::Result<i32> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match &self.command {
            Commands::Run(cmd) => cmd.execute(self),
            Commands::Plan(cmd) => cmd.execute(self),
            Commands::Cache(cmd) => cmd.execute(self),
            Commands::History(cmd) => cmd.execute(self),
            Commands::Completions(cmd) => cmd.execute(self),
        }
    }

    /// Whether human-readable progress should be printed
    pub fn show_progress(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "anvil", "-C", "/tmp", "run", "compile", "test", "--parallelism", "2", "--fail-fast",
            "--no-cache",
        ]);
        assert_eq!(cli.directory, Some(std::path::PathBuf::from("/tmp")));
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.tasks, vec!["compile", "test"]);
                assert_eq!(run.parallelism, Some(2));
                assert!(run.fail_fast);
                assert!(run.no_cache);
                assert!(!run.dry_run);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }
}
