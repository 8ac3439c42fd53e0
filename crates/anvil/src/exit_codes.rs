//! Exit codes for the CLI

/// Success
pub const SUCCESS: i32 = anvil_tasks::exit_code::SUCCESS;

/// A task failed, or any other runtime error
pub const ERROR: i32 = anvil_tasks::exit_code::TASK_FAILED;

/// Configuration or task graph error
pub const CONFIG_ERROR: i32 = anvil_tasks::exit_code::CONFIG_ERROR;

/// Dependency cycle in the task graph
pub const CYCLE: i32 = anvil_tasks::exit_code::CYCLE;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Map an error that escaped a command to a process exit code
pub fn for_error(err: &anyhow::Error) -> i32 {
    if let Some(build) = err.downcast_ref::<anvil_tasks::BuildError>() {
        return build.exit_code();
    }
    if let Some(graph) = err.downcast_ref::<anvil_tasks::GraphError>() {
        return match graph {
            anvil_tasks::GraphError::Cycle(_) => CYCLE,
            _ => CONFIG_ERROR,
        };
    }
    if err.downcast_ref::<anvil_core::AnvilError>().is_some()
        || err.downcast_ref::<anvil_core::ConfigError>().is_some()
    {
        return CONFIG_ERROR;
    }
    ERROR
}
