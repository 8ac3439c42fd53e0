//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::defaults::{DEFAULT_CACHE_MAX_AGE_DAYS, DEFAULT_SHELL, STATE_DIR};

/// Main configuration for Anvil
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project name
    pub name: Option<String>,

    /// Scheduling configuration
    pub build: BuildConfig,

    /// Build cache configuration
    pub cache: CacheConfig,

    /// Execution history configuration
    pub history: HistoryConfig,

    /// Task definitions, keyed by task name
    pub tasks: BTreeMap<String, TaskConfig>,
}

impl Config {
    /// Directory of the local build cache
    pub fn cache_dir(&self, root: &Path) -> PathBuf {
        resolve_dir(root, self.cache.dir.as_deref(), "cache")
    }

    /// Directory of the execution history store
    pub fn history_dir(&self, root: &Path) -> PathBuf {
        resolve_dir(root, self.history.dir.as_deref(), "history")
    }
}

fn resolve_dir(root: &Path, configured: Option<&Path>, default: &str) -> PathBuf {
    match configured {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => root.join(dir),
        None => root.join(STATE_DIR).join(default),
    }
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Maximum concurrent tasks; defaults to available parallelism
    pub parallelism: Option<usize>,

    /// Stop dispatching new tasks after the first failure
    pub fail_fast: bool,

    /// Shell used to run task commands
    pub shell: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            fail_fast: false,
            shell: DEFAULT_SHELL.to_string(),
        }
    }
}

/// Build cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,

    /// Cache directory, relative to the project root unless absolute
    pub dir: Option<PathBuf>,

    /// Entries older than this are removed by `cache prune`
    pub max_age_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_age_days: DEFAULT_CACHE_MAX_AGE_DAYS,
        }
    }
}

/// Execution history configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// History directory, relative to the project root unless absolute
    pub dir: Option<PathBuf>,
}

/// A task in the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Shell command to execute
    pub command: String,

    /// Human-readable description
    pub description: Option<String>,

    /// Tasks that must complete first
    pub depends_on: Vec<String>,

    /// Declared inputs
    pub inputs: Vec<InputConfig>,

    /// Declared outputs
    pub outputs: Vec<OutputConfig>,

    /// Whether outputs may be stored in and restored from the cache
    pub cacheable: bool,

    /// Never consider this task up to date
    pub always_run: bool,

    /// A task without outputs may be skipped when its inputs are unchanged
    pub idempotent: bool,

    /// Environment variables; part of the task's fingerprint
    pub env: BTreeMap<String, String>,

    /// Working directory, relative to the project root
    pub working_dir: Option<PathBuf>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            description: None,
            depends_on: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            cacheable: true,
            always_run: false,
            idempotent: false,
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

/// How an input's location contributes to its fingerprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationConfig {
    Absolute,
    #[default]
    Relative,
    NameOnly,
    ContentOnly,
}

/// A declared input
///
/// Accepts a bare path string, `{ file = .. }`, `{ dir = .. }` or
/// `{ name = .., value = .. }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputConfig {
    Path(PathBuf),
    File {
        file: PathBuf,
        #[serde(default)]
        normalization: NormalizationConfig,
    },
    Dir {
        dir: PathBuf,
        #[serde(default)]
        normalization: NormalizationConfig,
    },
    Value {
        name: String,
        value: serde_json::Value,
    },
}

impl InputConfig {
    /// Declared path, if this input is file based
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) | Self::File { file: p, .. } | Self::Dir { dir: p, .. } => Some(p),
            Self::Value { .. } => None,
        }
    }
}

/// A declared output
///
/// Accepts a bare path string (a file), `{ file = .. }` or `{ dir = .. }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputConfig {
    Path(PathBuf),
    File { file: PathBuf },
    Dir { dir: PathBuf },
}

impl OutputConfig {
    pub fn path(&self) -> &Path {
        match self {
            Self::Path(p) | Self::File { file: p } | Self::Dir { dir: p } => p,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.cache.enabled);
        assert!(!config.build.fail_fast);
        assert_eq!(config.build.shell, "sh");
        assert_eq!(config.cache_dir(Path::new("/ws")), PathBuf::from("/ws/.anvil/cache"));
        assert_eq!(config.history_dir(Path::new("/ws")), PathBuf::from("/ws/.anvil/history"));
    }

    #[test]
    fn test_configured_dirs() {
        let mut config = Config::default();
        config.cache.dir = Some(PathBuf::from("/shared/cache"));
        config.history.dir = Some(PathBuf::from("build/history"));
        assert_eq!(config.cache_dir(Path::new("/ws")), PathBuf::from("/shared/cache"));
        assert_eq!(config.history_dir(Path::new("/ws")), PathBuf::from("/ws/build/history"));
    }

    #[test]
    fn test_parse_task_inputs() {
        let toml = r#"
[tasks.compile]
command = "cc -o out/app src/main.c"
inputs = [
    "src/main.c",
    { dir = "include", normalization = "content_only" },
    { name = "opt-level", value = 2 },
]
outputs = [{ file = "out/app" }, { dir = "out/obj" }]
env = { CC = "clang" }
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let task = &config.tasks["compile"];

        assert_eq!(task.inputs[0], InputConfig::Path(PathBuf::from("src/main.c")));
        assert_eq!(
            task.inputs[1],
            InputConfig::Dir {
                dir: PathBuf::from("include"),
                normalization: NormalizationConfig::ContentOnly,
            }
        );
        assert_eq!(
            task.inputs[2],
            InputConfig::Value {
                name: "opt-level".to_string(),
                value: serde_json::json!(2),
            }
        );
        assert_eq!(task.outputs[1].path(), Path::new("out/obj"));
        assert!(task.cacheable);
        assert_eq!(task.env["CC"], "clang");
    }
}
