//! The project a command operates on: root, configuration and stores

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use anvil_core::config::{load_config_or_default, Config, InputConfig, NormalizationConfig, OutputConfig};
use anvil_tasks::{
    BuildCache, BuildContext, HistoryStore, InputSpec, LocalCache, Normalization, OutputSpec, TaskDefinition,
    TaskGraph, TaskRegistry,
};

use super::shell::ShellAction;

/// A loaded project
#[derive(Debug)]
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
    pub config_path: Option<PathBuf>,
}

impl Project {
    /// Load the project containing the current directory.
    ///
    /// The root is the directory holding the config file, or the current
    /// directory when there is none.
    pub fn load() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::load_from(&cwd)
    }

    pub fn load_from(dir: &Path) -> anyhow::Result<Self> {
        let (config, config_path) = load_config_or_default(dir)?;
        let root = config_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.to_path_buf());
        debug!(root = %root.display(), tasks = config.tasks.len(), "project loaded");
        Ok(Self {
            root,
            config,
            config_path,
        })
    }

    pub fn cache(&self) -> LocalCache {
        LocalCache::new(self.config.cache_dir(&self.root))
    }

    pub fn history(&self) -> HistoryStore {
        HistoryStore::new(self.config.history_dir(&self.root))
    }

    /// Build context for one invocation
    pub fn context(&self, use_cache: bool) -> BuildContext {
        let cache: Option<Arc<dyn BuildCache>> = if use_cache && self.config.cache.enabled {
            Some(Arc::new(self.cache()))
        } else {
            None
        };
        BuildContext::new(&self.root, self.history(), cache)
    }

    /// Register every configured task
    pub fn registry(&self) -> anyhow::Result<TaskRegistry> {
        let mut registry = TaskRegistry::new(&self.root);
        for (name, task) in &self.config.tasks {
            let action = Arc::new(ShellAction::new(&self.config.build.shell, task));
            let mut definition = TaskDefinition::new(name.as_str(), action)
                .with_cacheable(task.cacheable)
                .with_always_run(task.always_run)
                .with_idempotent(task.idempotent);
            if let Some(description) = &task.description {
                definition = definition.with_description(description);
            }
            for dep in &task.depends_on {
                definition = definition.with_depends_on(dep.as_str());
            }
            for input in &task.inputs {
                definition = definition.with_input(input_spec(input));
            }
            for output in &task.outputs {
                definition = definition.with_output(output_spec(output));
            }
            registry
                .register(definition)
                .with_context(|| format!("registering task '{}'", name))?;
        }
        Ok(registry)
    }

    /// Register and freeze the task graph
    pub fn graph(&self) -> anyhow::Result<TaskGraph> {
        Ok(self.registry()?.freeze()?)
    }
}

fn normalization(mode: NormalizationConfig) -> Normalization {
    match mode {
        NormalizationConfig::Absolute => Normalization::Absolute,
        NormalizationConfig::Relative => Normalization::Relative,
        NormalizationConfig::NameOnly => Normalization::NameOnly,
        NormalizationConfig::ContentOnly => Normalization::ContentOnly,
    }
}

fn input_spec(input: &InputConfig) -> InputSpec {
    match input {
        InputConfig::Path(path) => InputSpec::file(path),
        InputConfig::File {
            file,
            normalization: mode,
        } => InputSpec::file(file).with_normalization(normalization(*mode)),
        InputConfig::Dir {
            dir,
            normalization: mode,
        } => InputSpec::dir(dir).with_normalization(normalization(*mode)),
        InputConfig::Value { name, value } => InputSpec::value(name, value.clone()),
    }
}

fn output_spec(output: &OutputConfig) -> OutputSpec {
    match output {
        OutputConfig::Path(path) | OutputConfig::File { file: path } => OutputSpec::file(path),
        OutputConfig::Dir { dir } => OutputSpec::dir(dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_project_root_is_config_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("anvil.toml"),
            "[tasks.compile]\ncommand = \"true\"\noutputs = [\"out/app\"]\n\n[tasks.test]\ncommand = \"true\"\ndepends_on = [\"compile\"]\ninputs = [\"out/app\"]\n",
        )
        .unwrap();
        let nested = temp.path().join("src");
        std::fs::create_dir_all(&nested).unwrap();

        let project = Project::load_from(&nested).unwrap();
        assert_eq!(project.root, temp.path());

        let graph = project.graph().unwrap();
        assert_eq!(graph.len(), 2);
        let sorted: Vec<String> = graph.sorted().iter().map(|id| id.to_string()).collect();
        assert_eq!(sorted, vec!["compile", "test"]);
    }

    #[test]
    fn test_cache_disabled_in_config() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("anvil.toml"), "[cache]\nenabled = false\n").unwrap();

        let project = Project::load_from(temp.path()).unwrap();
        assert!(project.context(true).cache().is_none());
    }

    #[test]
    fn test_input_mapping() {
        let spec = input_spec(&InputConfig::Dir {
            dir: PathBuf::from("include"),
            normalization: NormalizationConfig::ContentOnly,
        });
        assert_eq!(spec, InputSpec::dir("include").with_normalization(Normalization::ContentOnly));
    }
}
