//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::{Config, InputConfig, TaskConfig};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_build(config)?;
    validate_cache(config)?;
    for (name, task) in &config.tasks {
        validate_task(config, name, task)?;
    }
    debug!("configuration validation passed");
    Ok(())
}

fn validate_build(config: &Config) -> Result<()> {
    if config.build.parallelism == Some(0) {
        return Err(ConfigError::invalid("build.parallelism", "must be greater than zero").into());
    }

    if config.build.shell.trim().is_empty() {
        return Err(ConfigError::invalid("build.shell", "shell cannot be empty").into());
    }

    Ok(())
}

fn validate_cache(config: &Config) -> Result<()> {
    if config
        .cache
        .dir
        .as_ref()
        .is_some_and(|d| d.as_os_str().is_empty())
    {
        return Err(ConfigError::invalid("cache.dir", "directory cannot be empty").into());
    }

    if config
        .history
        .dir
        .as_ref()
        .is_some_and(|d| d.as_os_str().is_empty())
    {
        return Err(ConfigError::invalid("history.dir", "directory cannot be empty").into());
    }

    Ok(())
}

fn validate_task(config: &Config, name: &str, task: &TaskConfig) -> Result<()> {
    let field = |f: &str| format!("tasks.{}.{}", name, f);

    if name.trim().is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ConfigError::invalid(
            format!("tasks.{}", name),
            "task names cannot be empty or contain whitespace",
        )
        .into());
    }

    if task.command.trim().is_empty() {
        return Err(ConfigError::invalid(field("command"), "command cannot be empty").into());
    }

    for dep in &task.depends_on {
        if !config.tasks.contains_key(dep) {
            return Err(ConfigError::invalid(field("depends_on"), format!("unknown task '{}'", dep)).into());
        }
        if dep == name {
            return Err(ConfigError::invalid(field("depends_on"), "a task cannot depend on itself").into());
        }
    }

    for input in &task.inputs {
        match input {
            InputConfig::Value { name: value_name, .. } if value_name.trim().is_empty() => {
                return Err(ConfigError::invalid(field("inputs"), "value inputs need a name").into());
            }
            other if other.path().is_some_and(|p| p.as_os_str().is_empty()) => {
                return Err(ConfigError::invalid(field("inputs"), "input path cannot be empty").into());
            }
            _ => {}
        }
    }

    if task.outputs.iter().any(|o| o.path().as_os_str().is_empty()) {
        return Err(ConfigError::invalid(field("outputs"), "output path cannot be empty").into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnvilError;
    use crate::config::types::OutputConfig;
    use std::path::PathBuf;

    fn task(command: &str) -> TaskConfig {
        TaskConfig {
            command: command.to_string(),
            ..Default::default()
        }
    }

    fn invalid_field(config: &Config) -> String {
        match validate_config(config) {
            Err(AnvilError::Config(ConfigError::InvalidValue { field, .. })) => field,
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut config = Config::default();
        config.build.parallelism = Some(0);
        assert_eq!(invalid_field(&config), "build.parallelism");
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut config = Config::default();
        config.tasks.insert("build".to_string(), task("  "));
        assert_eq!(invalid_field(&config), "tasks.build.command");
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut config = Config::default();
        let mut test = task("cargo test");
        test.depends_on.push("compile".to_string());
        config.tasks.insert("test".to_string(), test);
        assert_eq!(invalid_field(&config), "tasks.test.depends_on");

        config.tasks.insert("compile".to_string(), task("cargo build"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_output_rejected() {
        let mut config = Config::default();
        let mut build = task("make");
        build.outputs.push(OutputConfig::Path(PathBuf::new()));
        config.tasks.insert("build".to_string(), build);
        assert_eq!(invalid_field(&config), "tasks.build.outputs");
    }

    #[test]
    fn test_empty_cache_dir_rejected() {
        let mut config = Config::default();
        config.cache.dir = Some(PathBuf::new());
        assert_eq!(invalid_field(&config), "cache.dir");
    }
}
