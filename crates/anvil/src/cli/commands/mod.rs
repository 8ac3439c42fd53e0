//! CLI commands

mod cache;
mod completions;
mod history;
mod plan;
mod run;

pub use cache::CacheCommand;
pub use completions::CompletionsCommand;
pub use history::HistoryCommand;
pub use plan::PlanCommand;
pub use run::RunCommand;

use anvil_tasks::TaskId;

/// Convert task names given on the command line
fn task_ids(names: &[String]) -> Vec<TaskId> {
    names.iter().map(|n| TaskId::new(n.as_str())).collect()
}
