//! Plan command: show what a run would schedule

use clap::Args;

use super::task_ids;
use crate::cli::output;
use crate::cli::{Cli, OutputFormat, Project};
use crate::exit_codes;

/// Show the execution plan without running anything
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Tasks to plan (all configured tasks when omitted)
    pub tasks: Vec<String>,
}

impl PlanCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let project = Project::load()?;
        let graph = project.graph()?;
        let plan = graph.plan(&task_ids(&self.tasks))?;

        if cli.format == OutputFormat::Json {
            let levels: Vec<serde_json::Value> = plan
                .levels()
                .iter()
                .enumerate()
                .map(|(level, tasks)| {
                    serde_json::json!({
                        "level": level,
                        "tasks": tasks.iter().map(|&idx| {
                            let task = plan.task(idx);
                            serde_json::json!({
                                "id": task.id,
                                "action": task.action.describe(),
                                "depends_on": plan.dependencies(idx).iter().map(|&d| plan.task(d).id.clone()).collect::<Vec<_>>(),
                                "inferred": plan.inferred(idx).iter().map(|&d| plan.task(d).id.clone()).collect::<Vec<_>>(),
                                "cacheable": task.is_cacheable(),
                            })
                        }).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&levels)?);
            return Ok(exit_codes::SUCCESS);
        }

        if plan.is_empty() {
            if !cli.quiet {
                output::success("No tasks to run.");
            }
            return Ok(exit_codes::SUCCESS);
        }

        if !cli.quiet {
            output::info(&format!(
                "{} in {}",
                output::plural(plan.len(), "task"),
                output::plural(plan.levels().len(), "level")
            ));
            println!();
            print!("{}", plan.describe());
        }

        Ok(exit_codes::SUCCESS)
    }
}
