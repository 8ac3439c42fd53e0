//! Task graph construction and validation

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::plan::ExecutionPlan;
use crate::task::{Task, TaskDefinition, TaskId};

/// A node in the frozen task graph
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// The frozen task
    pub task: Arc<Task>,
    /// Indices of tasks that must complete before this one (explicit and inferred)
    pub dependencies: Vec<usize>,
    /// Indices of dependencies that were inferred from output/input overlap
    pub inferred: Vec<usize>,
    /// Indices of tasks waiting on this one
    pub dependents: Vec<usize>,
}

/// Collects task definitions for one build invocation
#[derive(Debug)]
pub struct TaskRegistry {
    root: PathBuf,
    definitions: Vec<TaskDefinition>,
    ids: HashSet<TaskId>,
}

impl TaskRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            definitions: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Register a task. Identifiers must be unique.
    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), GraphError> {
        if !self.ids.insert(definition.id.clone()) {
            return Err(GraphError::DuplicateTask(definition.id.to_string()));
        }
        debug!(task = %definition.id, "registered task");
        self.definitions.push(definition);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Resolve deferred values and build the validated graph
    pub fn freeze(self) -> Result<TaskGraph, GraphError> {
        TaskGraph::build(&self.root, self.definitions)
    }
}

/// Directed acyclic graph of every registered task
#[derive(Debug, Clone)]
pub struct TaskGraph {
    root: PathBuf,
    nodes: Vec<TaskNode>,
    index: HashMap<TaskId, usize>,
    /// Dependencies before dependents
    sorted_order: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl TaskGraph {
    /// Build a task graph from definitions.
    ///
    /// Explicit `depends_on` edges are resolved by id. A further edge is inferred
    /// wherever a task declares an input that overlaps another task's declared
    /// output: the consumer runs after the producer. The result is checked for
    /// cycles before it is returned.
    #[instrument(skip_all, fields(tasks = definitions.len()))]
    pub fn build(root: &Path, definitions: Vec<TaskDefinition>) -> Result<Self, GraphError> {
        let mut index: HashMap<TaskId, usize> = HashMap::new();
        let mut tasks: Vec<Arc<Task>> = Vec::with_capacity(definitions.len());

        for (i, definition) in definitions.into_iter().enumerate() {
            if index.contains_key(&definition.id) {
                return Err(GraphError::DuplicateTask(definition.id.to_string()));
            }
            index.insert(definition.id.clone(), i);
            tasks.push(Arc::new(Task::freeze(definition, i, root)));
        }

        let mut nodes: Vec<TaskNode> = tasks
            .iter()
            .map(|task| TaskNode {
                task: task.clone(),
                dependencies: Vec::new(),
                inferred: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        // Explicit edges
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let dep_idx = *index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    task: task.id.to_string(),
                    dependency: dep.to_string(),
                })?;
                // A self-dependency stays as an edge and is reported as a cycle
                if !nodes[i].dependencies.contains(&dep_idx) {
                    nodes[i].dependencies.push(dep_idx);
                }
            }
        }

        // Inferred edges: consumer after producer
        let mut inferred_count = 0;
        for (consumer_idx, consumer) in tasks.iter().enumerate() {
            if consumer.input_paths().is_empty() {
                continue;
            }
            for (producer_idx, producer) in tasks.iter().enumerate() {
                if producer_idx == consumer_idx || producer.output_paths().is_empty() {
                    continue;
                }
                if consumer.consumes_from(producer) {
                    let node = &mut nodes[consumer_idx];
                    if !node.dependencies.contains(&producer_idx) {
                        node.dependencies.push(producer_idx);
                        node.inferred.push(producer_idx);
                        inferred_count += 1;
                        debug!(
                            producer = %producer.id,
                            consumer = %consumer.id,
                            "inferred ordering edge from output/input overlap"
                        );
                    }
                }
            }
        }

        for node in &mut nodes {
            node.dependencies.sort_unstable();
            node.inferred.sort_unstable();
        }

        for i in 0..nodes.len() {
            for dep in nodes[i].dependencies.clone() {
                nodes[dep].dependents.push(i);
            }
        }

        let sorted_order = Self::topological_sort(&nodes)?;

        info!(
            task_count = nodes.len(),
            inferred_edges = inferred_count,
            "task graph built"
        );

        Ok(Self {
            root: root.to_path_buf(),
            nodes,
            index,
            sorted_order,
        })
    }

    /// Depth-first topological sort with three-colour marking.
    ///
    /// Reaching an in-progress node is a back edge; the error names the full cycle.
    fn topological_sort(nodes: &[TaskNode]) -> Result<Vec<usize>, GraphError> {
        let mut marks = vec![Mark::Unvisited; nodes.len()];
        let mut sorted = Vec::with_capacity(nodes.len());
        let mut path: Vec<usize> = Vec::new();

        fn visit(
            nodes: &[TaskNode],
            current: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
            sorted: &mut Vec<usize>,
        ) -> Result<(), CycleError> {
            match marks[current] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    let start = path.iter().position(|&n| n == current).unwrap_or(0);
                    let mut cycle: Vec<TaskId> = path[start..]
                        .iter()
                        .map(|&n| nodes[n].task.id.clone())
                        .collect();
                    cycle.push(nodes[current].task.id.clone());
                    return Err(CycleError { path: cycle });
                }
                Mark::Unvisited => {}
            }

            marks[current] = Mark::InProgress;
            path.push(current);
            for &dep in &nodes[current].dependencies {
                visit(nodes, dep, marks, path, sorted)?;
            }
            path.pop();
            marks[current] = Mark::Done;
            sorted.push(current);
            Ok(())
        }

        for start in 0..nodes.len() {
            visit(nodes, start, &mut marks, &mut path, &mut sorted)?;
        }

        Ok(sorted)
    }

    /// Select the requested tasks and everything they transitively depend on.
    ///
    /// An empty request selects every task.
    pub fn plan(&self, requested: &[TaskId]) -> Result<ExecutionPlan, GraphError> {
        let mut selected = vec![false; self.nodes.len()];

        if requested.is_empty() {
            selected.iter_mut().for_each(|s| *s = true);
        } else {
            let mut stack = Vec::new();
            for id in requested {
                let idx = *self
                    .index
                    .get(id)
                    .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
                stack.push(idx);
            }
            while let Some(idx) = stack.pop() {
                if selected[idx] {
                    continue;
                }
                selected[idx] = true;
                stack.extend(self.nodes[idx].dependencies.iter().copied());
            }
        }

        Ok(ExecutionPlan::from_graph(self, &selected))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topologically sorted task ids, dependencies first
    pub fn sorted(&self) -> Vec<&TaskId> {
        self.sorted_order
            .iter()
            .map(|&i| &self.nodes[i].task.id)
            .collect()
    }
}

/// A dependency cycle, listed in dependency direction and closed on its first task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub path: Vec<TaskId>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<&str> = self.path.iter().map(TaskId::as_str).collect();
        write!(f, "{}", rendered.join(" -> "))
    }
}

impl std::error::Error for CycleError {}

/// Errors during graph construction
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Cyclic dependency detected
    #[error("Cyclic dependency detected: {0}")]
    Cycle(#[from] CycleError),

    /// Two tasks share an identifier
    #[error("Task '{0}' is registered more than once")]
    DuplicateTask(String),

    /// A task depends on an id nobody registered
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    /// A requested task does not exist
    #[error("Task '{0}' not found")]
    UnknownTask(String),
}
