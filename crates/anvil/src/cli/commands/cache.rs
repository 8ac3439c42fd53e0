//! Cache management command

use std::time::Duration;

use clap::{Args, Subcommand};
use console::style;

use crate::cli::{Cli, OutputFormat, Project};
use crate::exit_codes;

/// Build cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Remove old cache entries
    Prune(CachePruneCommand),
    /// Show cache statistics
    Status(CacheStatusCommand),
    /// Clear all cached entries
    Clean(CacheCleanCommand),
}

/// Prune old cache entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Maximum age in days (defaults to `cache.max_age_days`)
    #[arg(long)]
    pub max_age_days: Option<u64>,
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// Clear all cached entries
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        match &self.action {
            CacheAction::Prune(cmd) => cmd.execute(cli),
            CacheAction::Status(cmd) => cmd.execute(cli),
            CacheAction::Clean(cmd) => cmd.execute(cli),
        }
    }
}

impl CachePruneCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let project = Project::load()?;
        let cache = project.cache();
        let days = self.max_age_days.unwrap_or(project.config.cache.max_age_days);
        let max_age = Duration::from_secs(days * 24 * 60 * 60);

        if cli.show_progress() {
            println!(
                "{} Pruning cache entries older than {}...",
                style("→").blue(),
                crate::cli::output::plural(days as usize, "day")
            );
        }

        let stats = cache.prune(max_age)?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "total": stats.total,
                "removed": stats.removed,
                "kept": stats.kept,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "  {} Removed {} of {} entries ({} kept)",
                style("✓").green(),
                stats.removed,
                stats.total,
                stats.kept
            );
        }

        Ok(exit_codes::SUCCESS)
    }
}

impl CacheStatusCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let project = Project::load()?;
        let cache = project.cache();
        let stats = cache.status()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "enabled": project.config.cache.enabled,
                "entries": stats.entries,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "cache_dir": cache.cache_dir().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", style("Build Cache Status").bold());
            println!();
            println!("  Location: {}", style(cache.cache_dir().display()).cyan());
            println!(
                "  Enabled:  {}",
                if project.config.cache.enabled { "yes" } else { "no" }
            );
            println!("  Entries:  {}", stats.entries);
            println!("  Size:     {}", style(stats.formatted_size()).yellow());
        }

        Ok(exit_codes::SUCCESS)
    }
}

impl CacheCleanCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let project = Project::load()?;
        let cache = project.cache();
        let cache_dir = cache.cache_dir().to_path_buf();

        if !cache_dir.exists() {
            if !cli.quiet {
                println!("{} Cache directory does not exist.", style("✓").green());
            }
            return Ok(exit_codes::SUCCESS);
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!("Remove all cached entries at {}?", cache_dir.display()))
                .default(false)
                .interact()?;

            if !confirmed {
                if !cli.quiet {
                    println!("Aborted.");
                }
                return Ok(exit_codes::SUCCESS);
            }
        }

        cache.clear()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "cleared": true,
                "cache_dir": cache_dir.display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "{} Cache cleared at {}",
                style("✓").green(),
                style(cache_dir.display()).cyan()
            );
        }

        Ok(exit_codes::SUCCESS)
    }
}
