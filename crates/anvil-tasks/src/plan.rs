//! Execution plan: the frozen subgraph selected for one invocation

use std::collections::VecDeque;
use std::sync::Arc;

use crate::graph::TaskGraph;
use crate::task::{Task, TaskId};

/// The selected tasks of a build, indexed densely in declaration order
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    tasks: Vec<Arc<Task>>,
    dependencies: Vec<Vec<usize>>,
    inferred: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Tasks grouped by dependency depth (level 0 has no dependencies)
    levels: Vec<Vec<usize>>,
}

impl ExecutionPlan {
    pub(crate) fn from_graph(graph: &TaskGraph, selected: &[bool]) -> Self {
        let mut remap = vec![usize::MAX; selected.len()];
        let mut tasks = Vec::new();
        for (old, node) in graph.nodes().iter().enumerate() {
            if selected[old] {
                remap[old] = tasks.len();
                tasks.push(node.task.clone());
            }
        }

        let mut dependencies = vec![Vec::new(); tasks.len()];
        let mut inferred = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];
        for (old, node) in graph.nodes().iter().enumerate() {
            let new = remap[old];
            if new == usize::MAX {
                continue;
            }
            for &dep in &node.dependencies {
                let dep_new = remap[dep];
                if dep_new != usize::MAX {
                    dependencies[new].push(dep_new);
                    dependents[dep_new].push(new);
                }
            }
            inferred[new] = node
                .inferred
                .iter()
                .map(|&d| remap[d])
                .filter(|&d| d != usize::MAX)
                .collect();
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        let levels = Self::compute_levels(&dependencies, &dependents);

        Self {
            tasks,
            dependencies,
            inferred,
            dependents,
            levels,
        }
    }

    /// Group tasks into levels using Kahn's algorithm
    fn compute_levels(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<Vec<usize>> {
        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut level = vec![0usize; dependencies.len()];
        let mut queue: VecDeque<usize> = (0..dependencies.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        while let Some(i) = queue.pop_front() {
            for &dependent in &dependents[i] {
                level[dependent] = level[dependent].max(level[i] + 1);
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        let max_level = level.iter().max().copied().unwrap_or(0);
        let mut levels = vec![Vec::new(); if level.is_empty() { 0 } else { max_level + 1 }];
        for (i, &l) in level.iter().enumerate() {
            levels[l].push(i);
        }
        levels
    }

    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn task(&self, idx: usize) -> &Arc<Task> {
        &self.tasks[idx]
    }

    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Dependencies inferred from input/output overlap
    pub fn inferred(&self, idx: usize) -> &[usize] {
        &self.inferred[idx]
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }

    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| &t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Human-readable summary of the execution plan
    pub fn describe(&self) -> String {
        let mut plan = String::new();
        for (i, level) in self.levels.iter().enumerate() {
            plan.push_str(&format!("Level {} ({} tasks):\n", i, level.len()));
            for &idx in level {
                let task = &self.tasks[idx];
                let deps: Vec<String> = self.dependencies[idx]
                    .iter()
                    .map(|&d| {
                        if self.inferred[idx].contains(&d) {
                            format!("{} (inferred)", self.tasks[d].id)
                        } else {
                            self.tasks[d].id.to_string()
                        }
                    })
                    .collect();
                if deps.is_empty() {
                    plan.push_str(&format!("  {} -> {}\n", task.id, task.action.describe()));
                } else {
                    plan.push_str(&format!(
                        "  {} -> {} (after: {})\n",
                        task.id,
                        task.action.describe(),
                        deps.join(", ")
                    ));
                }
            }
        }
        plan
    }
}
