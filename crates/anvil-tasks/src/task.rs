//! Task types and definitions

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Unique identifier for a task within the build
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new task ID
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Create a task ID scoped to a project, rendered as `project:name`
    pub fn scoped(project: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", project.as_ref(), name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How much of a file's location participates in its fingerprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Content hash plus the absolute path
    Absolute,
    /// Content hash plus the path relative to the build root
    #[default]
    Relative,
    /// Content hash plus the file name only
    NameOnly,
    /// Content hash only; moving or renaming never invalidates
    ContentOnly,
}

/// A declared task input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSpec {
    /// A single file
    File {
        path: PathBuf,
        #[serde(default)]
        normalization: Normalization,
    },
    /// A directory tree
    Directory {
        path: PathBuf,
        #[serde(default)]
        normalization: Normalization,
    },
    /// An opaque value (compiler flags, tool versions, ...)
    Value {
        name: String,
        value: serde_json::Value,
    },
}

impl InputSpec {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            normalization: Normalization::default(),
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self::Directory {
            path: path.into(),
            normalization: Normalization::default(),
        }
    }

    pub fn value(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::Value {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Replace the normalization mode. No effect on value inputs.
    pub fn with_normalization(mut self, mode: Normalization) -> Self {
        match &mut self {
            Self::File { normalization, .. } | Self::Directory { normalization, .. } => {
                *normalization = mode;
            }
            Self::Value { .. } => {}
        }
        self
    }

    /// The declared path, if this input is file-based
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } | Self::Directory { path, .. } => Some(path),
            Self::Value { .. } => None,
        }
    }
}

/// A declared task output. The task is the sole writer of this path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSpec {
    File { path: PathBuf },
    Directory { path: PathBuf },
}

impl OutputSpec {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self::Directory { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::File { path } | Self::Directory { path } => path,
        }
    }
}

/// A value that is either known at registration or computed when the graph is frozen.
///
/// Deferred values are evaluated exactly once, by [`Provider::resolve`], which consumes
/// the provider.
pub enum Provider<T> {
    Value(T),
    Deferred(Box<dyn FnOnce() -> T + Send>),
}

impl<T> Provider<T> {
    pub fn deferred<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::Deferred(Box::new(f))
    }

    pub fn resolve(self) -> T {
        match self {
            Self::Value(v) => v,
            Self::Deferred(f) => f(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Context handed to an action when it runs
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub root_dir: PathBuf,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(task: &Task, root_dir: &Path, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            id: task.id.clone(),
            root_dir: root_dir.to_path_buf(),
            inputs: task.inputs.clone(),
            outputs: task.outputs.clone(),
            cancelled,
        }
    }

    /// Resolve a declared path against the build root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        normalize_path(&self.root_dir, path)
    }

    /// Whether the build has been cancelled (fail-fast). Actions may poll this cooperatively.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Errors raised by a task action
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },
}

impl ActionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// The executable part of a task. The engine never inspects concrete action types.
#[async_trait]
pub trait TaskAction: Send + Sync {
    /// Perform the work
    async fn execute(&self, ctx: &TaskContext) -> Result<(), ActionError>;

    /// Identity of the logic that produces the outputs. A change invalidates
    /// history and cache keys even when inputs are unchanged.
    fn implementation_hash(&self) -> String;

    /// Short human-readable label for reporting
    fn describe(&self) -> String {
        "<action>".to_string()
    }
}

/// Action backed by a synchronous closure
pub struct FnAction<F> {
    version: String,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&TaskContext) -> Result<(), ActionError> + Send + Sync,
{
    pub fn new(version: impl Into<String>, f: F) -> Self {
        Self {
            version: version.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> TaskAction for FnAction<F>
where
    F: Fn(&TaskContext) -> Result<(), ActionError> + Send + Sync,
{
    async fn execute(&self, ctx: &TaskContext) -> Result<(), ActionError> {
        (self.f)(ctx)
    }

    fn implementation_hash(&self) -> String {
        self.version.clone()
    }

    fn describe(&self) -> String {
        format!("<fn {}>", self.version)
    }
}

/// Registration-time description of a task
pub struct TaskDefinition {
    pub id: TaskId,
    pub description: Option<String>,
    pub inputs: Vec<Provider<Vec<InputSpec>>>,
    pub outputs: Vec<Provider<Vec<OutputSpec>>>,
    pub depends_on: Vec<TaskId>,
    pub cacheable: bool,
    pub always_run: bool,
    pub idempotent: bool,
    pub action: Arc<dyn TaskAction>,
}

impl TaskDefinition {
    /// Create a new task definition
    pub fn new(id: impl Into<TaskId>, action: Arc<dyn TaskAction>) -> Self {
        Self {
            id: id.into(),
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            depends_on: Vec::new(),
            cacheable: false,
            always_run: false,
            idempotent: false,
            action,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(Provider::Value(vec![input]));
        self
    }

    /// Inputs computed when the graph is frozen
    pub fn with_inputs_from<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Vec<InputSpec> + Send + 'static,
    {
        self.inputs.push(Provider::deferred(f));
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(Provider::Value(vec![output]));
        self
    }

    /// Outputs computed when the graph is frozen
    pub fn with_outputs_from<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Vec<OutputSpec> + Send + 'static,
    {
        self.outputs.push(Provider::deferred(f));
        self
    }

    pub fn with_depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_always_run(mut self, always_run: bool) -> Self {
        self.always_run = always_run;
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .field("cacheable", &self.cacheable)
            .field("always_run", &self.always_run)
            .field("action", &self.action.describe())
            .finish_non_exhaustive()
    }
}

/// A frozen task. Immutable once the graph is built.
pub struct Task {
    pub id: TaskId,
    pub description: Option<String>,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub depends_on: Vec<TaskId>,
    pub cacheable: bool,
    pub always_run: bool,
    pub idempotent: bool,
    pub action: Arc<dyn TaskAction>,
    /// Position in registration order
    pub index: usize,
    input_paths: Vec<PathBuf>,
    output_paths: Vec<PathBuf>,
}

impl Task {
    /// Freeze a definition, resolving deferred inputs and outputs exactly once
    pub(crate) fn freeze(definition: TaskDefinition, index: usize, root: &Path) -> Self {
        let inputs: Vec<InputSpec> = definition
            .inputs
            .into_iter()
            .flat_map(Provider::resolve)
            .collect();
        let outputs: Vec<OutputSpec> = definition
            .outputs
            .into_iter()
            .flat_map(Provider::resolve)
            .collect();

        let input_paths = inputs
            .iter()
            .filter_map(InputSpec::path)
            .map(|p| normalize_path(root, p))
            .collect();
        let output_paths = outputs
            .iter()
            .map(|o| normalize_path(root, o.path()))
            .collect();

        Self {
            id: definition.id,
            description: definition.description,
            inputs,
            outputs,
            depends_on: definition.depends_on,
            cacheable: definition.cacheable,
            always_run: definition.always_run,
            idempotent: definition.idempotent,
            action: definition.action,
            index,
            input_paths,
            output_paths,
        }
    }

    /// Normalized absolute paths of file-based inputs
    pub fn input_paths(&self) -> &[PathBuf] {
        &self.input_paths
    }

    /// Normalized absolute output paths
    pub fn output_paths(&self) -> &[PathBuf] {
        &self.output_paths
    }

    /// Whether outputs may be stored in and restored from the build cache
    pub fn is_cacheable(&self) -> bool {
        self.cacheable && !self.outputs.is_empty()
    }

    /// Whether this task reads anything `producer` writes
    pub fn consumes_from(&self, producer: &Task) -> bool {
        self.input_paths
            .iter()
            .any(|i| producer.output_paths.iter().any(|o| paths_overlap(i, o)))
    }

    /// Whether this task and `other` write overlapping paths
    pub fn outputs_overlap(&self, other: &Task) -> bool {
        self.output_paths
            .iter()
            .any(|a| other.output_paths.iter().any(|b| paths_overlap(a, b)))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Resolve `path` against `root` and fold `.` and `..` lexically
pub fn normalize_path(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Two paths overlap when they are equal or one contains the other
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> Arc<dyn TaskAction> {
        Arc::new(FnAction::new("v1", |_| Ok(())))
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId::scoped("core", "build");
        assert_eq!(id.to_string(), "core:build");
        assert_eq!(TaskId::from("lint").as_str(), "lint");
    }

    #[test]
    fn test_input_normalization_override() {
        let input = InputSpec::file("src/main.c").with_normalization(Normalization::ContentOnly);
        match input {
            InputSpec::File { normalization, .. } => {
                assert_eq!(normalization, Normalization::ContentOnly)
            }
            _ => panic!("expected file input"),
        }

        let value = InputSpec::value("opt", "-O2").with_normalization(Normalization::Absolute);
        assert!(value.path().is_none());
    }

    #[test]
    fn test_deferred_inputs_resolved_once_at_freeze() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let def = TaskDefinition::new("compile", noop())
            .with_input(InputSpec::file("a.c"))
            .with_inputs_from(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![InputSpec::file("b.c"), InputSpec::file("c.c")]
            });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let task = Task::freeze(def, 0, Path::new("/work"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.inputs.len(), 3);
        assert_eq!(task.input_paths()[2], PathBuf::from("/work/c.c"));
    }

    #[test]
    fn test_normalize_path() {
        let root = Path::new("/work/project");
        assert_eq!(
            normalize_path(root, Path::new("./build/../out/lib.a")),
            PathBuf::from("/work/project/out/lib.a")
        );
        assert_eq!(
            normalize_path(root, Path::new("/tmp/x")),
            PathBuf::from("/tmp/x")
        );
    }

    #[test]
    fn test_paths_overlap() {
        assert!(paths_overlap(Path::new("/out"), Path::new("/out/a.txt")));
        assert!(paths_overlap(Path::new("/out/a.txt"), Path::new("/out/a.txt")));
        assert!(!paths_overlap(Path::new("/out/a"), Path::new("/out/ab")));
        assert!(!paths_overlap(Path::new("/out"), Path::new("/other")));
    }

    #[test]
    fn test_consumes_from_directory_output() {
        let root = Path::new("/work");
        let producer = Task::freeze(
            TaskDefinition::new("gen", noop()).with_output(OutputSpec::dir("gen")),
            0,
            root,
        );
        let consumer = Task::freeze(
            TaskDefinition::new("compile", noop()).with_input(InputSpec::file("gen/api.h")),
            1,
            root,
        );
        assert!(consumer.consumes_from(&producer));
        assert!(!producer.consumes_from(&consumer));
    }

    #[test]
    fn test_cacheable_requires_outputs() {
        let root = Path::new("/work");
        let without = Task::freeze(
            TaskDefinition::new("check", noop()).with_cacheable(true),
            0,
            root,
        );
        assert!(!without.is_cacheable());

        let with = Task::freeze(
            TaskDefinition::new("build", noop())
                .with_cacheable(true)
                .with_output(OutputSpec::file("out.bin")),
            1,
            root,
        );
        assert!(with.is_cacheable());
    }

    #[tokio::test]
    async fn test_fn_action_executes() {
        let action = FnAction::new("v2", |ctx: &TaskContext| {
            if ctx.id.as_str() == "bad" {
                Err(ActionError::failed("boom"))
            } else {
                Ok(())
            }
        });
        assert_eq!(action.implementation_hash(), "v2");

        let root = Path::new("/work");
        let ok = Task::freeze(TaskDefinition::new("good", noop()), 0, root);
        let bad = Task::freeze(TaskDefinition::new("bad", noop()), 1, root);
        let flag = Arc::new(AtomicBool::new(false));

        assert!(action
            .execute(&TaskContext::new(&ok, root, flag.clone()))
            .await
            .is_ok());
        assert!(action
            .execute(&TaskContext::new(&bad, root, flag))
            .await
            .is_err());
    }
}
