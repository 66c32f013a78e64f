//! Dependency graph builder, cycle detection, and topological ordering.
//!
//! Uses `petgraph` to model task dependencies as a directed graph (edges
//! point from a dependency to its dependent). Cycles are found with a
//! DFS color-marking pass that reports the offending path; the topological
//! order comes from `petgraph::algo::toposort`.
//!
//! A task's `on_error` names a fallback handler. The handler is ordered after
//! every task that names it, but it is not a regular dependent: it only runs
//! once one of those tasks has failed.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use taskweave_types::workflow::{TaskSpec, Workflow};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural problems that make a task list unrunnable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workflow has no tasks")]
    Empty,

    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task '{task}' names unknown task '{handler}' as its on_error handler")]
    UnknownFallback { task: String, handler: String },

    #[error("fallback '{handler}' cannot depend on '{task}', the task it handles")]
    FallbackDependsOnSource { handler: String, task: String },

    #[error("cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Validated task DAG. Tasks are addressed by their index in declaration order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    fallback: Vec<Option<usize>>,
    fallback_sources: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph for a workflow, honoring its `sequential` flag.
    pub fn build(workflow: &Workflow) -> Result<Self, GraphError> {
        Self::from_tasks(&workflow.tasks, workflow.sequential)
    }

    /// Build the graph from an ordered task list.
    ///
    /// With `sequential`, a task that declares no `depends_on` implicitly
    /// depends on the closest earlier task that is not a fallback handler.
    /// Handlers never get an implicit edge.
    pub fn from_tasks(tasks: &[TaskSpec], sequential: bool) -> Result<Self, GraphError> {
        if tasks.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        let mut fallback = Vec::with_capacity(tasks.len());
        let mut fallback_sources = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            let handler = match &task.on_error {
                None => None,
                Some(handler) => {
                    let handler_idx =
                        *index.get(handler).ok_or_else(|| GraphError::UnknownFallback {
                            task: task.id.clone(),
                            handler: handler.clone(),
                        })?;
                    fallback_sources[handler_idx].push(i);
                    Some(handler_idx)
                }
            };
            fallback.push(handler);
        }

        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(tasks.len());
        let mut previous: Option<usize> = None;
        for (i, task) in tasks.iter().enumerate() {
            let is_handler = !fallback_sources[i].is_empty();
            let mut deps = Vec::with_capacity(task.depends_on.len());
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                let dep_idx = *index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                if fallback_sources[i].contains(&dep_idx) {
                    return Err(GraphError::FallbackDependsOnSource {
                        handler: task.id.clone(),
                        task: dep.clone(),
                    });
                }
                if seen.insert(dep_idx) {
                    deps.push(dep_idx);
                }
            }
            if sequential && !is_handler && task.depends_on.is_empty() {
                deps.extend(previous);
            }
            if !is_handler {
                previous = Some(i);
            }
            dependencies.push(deps);
        }

        let ordering: Vec<Vec<usize>> = dependencies
            .iter()
            .zip(&fallback_sources)
            .map(|(deps, sources)| deps.iter().chain(sources).copied().collect())
            .collect();
        if let Some(cycle) = find_cycle(&ordering) {
            return Err(GraphError::CyclicDependency {
                path: cycle.into_iter().map(|i| tasks[i].id.clone()).collect(),
            });
        }

        let mut graph = DiGraph::<usize, ()>::with_capacity(tasks.len(), tasks.len());
        let nodes: Vec<NodeIndex> = (0..tasks.len()).map(|i| graph.add_node(i)).collect();
        let mut dependents = vec![Vec::new(); tasks.len()];
        for (task_idx, deps) in dependencies.iter().enumerate() {
            for &dep_idx in deps {
                graph.add_edge(nodes[dep_idx], nodes[task_idx], ());
                dependents[dep_idx].push(task_idx);
            }
        }
        for (source, handler) in fallback.iter().enumerate() {
            if let Some(handler) = *handler {
                graph.update_edge(nodes[source], nodes[handler], ());
            }
        }

        let order: Vec<usize> = toposort(&graph, None)
            .map_err(|cycle| {
                let id = tasks[graph[cycle.node_id()]].id.clone();
                GraphError::CyclicDependency {
                    path: vec![id.clone(), id],
                }
            })?
            .into_iter()
            .map(|node| graph[node])
            .collect();

        Ok(Self {
            graph,
            nodes,
            ids: tasks.iter().map(|t| t.id.clone()).collect(),
            index,
            dependencies,
            dependents,
            fallback,
            fallback_sources,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn task_id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    /// Effective dependencies of a task (explicit plus implicit ordering).
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Tasks that directly depend on `idx`.
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Fallback handler named by `idx`, if any.
    pub fn fallback(&self, idx: usize) -> Option<usize> {
        self.fallback[idx]
    }

    /// Tasks that name `idx` as their fallback handler.
    pub fn fallback_sources(&self, idx: usize) -> &[usize] {
        &self.fallback_sources[idx]
    }

    pub fn is_fallback(&self, idx: usize) -> bool {
        !self.fallback_sources[idx].is_empty()
    }

    /// Tasks with no dependencies; ready as soon as execution starts.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.dependencies[i].is_empty() && !self.is_fallback(i))
            .collect()
    }

    /// A topological order: every task appears after all of its dependencies,
    /// and every fallback handler after the tasks it covers.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Every task reachable through dependent edges from `idx`, ascending.
    pub fn transitive_dependents(&self, idx: usize) -> Vec<usize> {
        let mut visited = HashSet::new();
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            for &next in &self.dependents[current] {
                if visited.insert(next) {
                    stack.push(next);
                }
            }
        }
        let mut out: Vec<usize> = visited.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Every task `idx` transitively waits on, ascending.
    pub fn transitive_dependencies(&self, idx: usize) -> Vec<usize> {
        let mut visited = HashSet::new();
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            for &next in &self.dependencies[current] {
                if visited.insert(next) {
                    stack.push(next);
                }
            }
        }
        let mut out: Vec<usize> = visited.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether `from` has a direct edge to `to` (i.e. `to` depends on `from`).
    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.graph.contains_edge(self.nodes[from], self.nodes[to])
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS color marking over dependency edges. Returns the first cycle found as
/// a closed path (first and last element equal).
///
/// The walk keeps its own stack of `(node, next edge)` frames so a long
/// chain cannot exhaust the thread stack.
fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut colors = vec![Color::White; dependencies.len()];
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for start in 0..dependencies.len() {
        if colors[start] != Color::White {
            continue;
        }
        colors[start] = Color::Gray;
        stack.push((start, 0));
        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let Some(&dep) = dependencies[node].get(frame.1) else {
                colors[node] = Color::Black;
                stack.pop();
                continue;
            };
            frame.1 += 1;
            match colors[dep] {
                Color::Gray => {
                    let begin = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                    let mut cycle: Vec<usize> = stack[begin..].iter().map(|&(n, _)| n).collect();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::White => {
                    colors[dep] = Color::Gray;
                    stack.push((dep, 0));
                }
                Color::Black => {}
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec::new(id, "builtin", "echo").depends_on(deps.iter().copied())
    }

    fn position(graph: &DependencyGraph, id: &str) -> usize {
        let idx = graph.index_of(id).unwrap();
        graph
            .topological_order()
            .iter()
            .position(|&i| i == idx)
            .unwrap()
    }

    #[test]
    fn test_independent_tasks_are_all_roots() {
        let graph =
            DependencyGraph::from_tasks(&[task("a", &[]), task("b", &[]), task("c", &[])], false)
                .unwrap();
        assert_eq!(graph.roots(), vec![0, 1, 2]);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_diamond_topological_order() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks, false).unwrap();
        assert!(position(&graph, "a") < position(&graph, "b"));
        assert!(position(&graph, "a") < position(&graph, "c"));
        assert!(position(&graph, "b") < position(&graph, "d"));
        assert!(position(&graph, "c") < position(&graph, "d"));
        assert_eq!(graph.dependents(0), &[1, 2]);
        assert!(graph.has_edge(1, 3));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = DependencyGraph::from_tasks(&[task("a", &[]), task("a", &[])], false)
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateTask("a".to_string()));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err =
            DependencyGraph::from_tasks(&[task("a", &[]), task("b", &["ghost"])], false)
                .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                task: "b".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_cycle_reports_path() {
        let tasks = vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"])];
        let err = DependencyGraph::from_tasks(&tasks, false).unwrap_err();
        match err {
            GraphError::CyclicDependency { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                for id in ["a", "b", "c"] {
                    assert!(path.contains(&id.to_string()));
                }
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = DependencyGraph::from_tasks(&[task("a", &["a"])], false).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                path: vec!["a".to_string(), "a".to_string()]
            }
        );
        assert!(err.to_string().contains("a -> a"));
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(
            DependencyGraph::from_tasks(&[], false).unwrap_err(),
            GraphError::Empty
        );
    }

    #[test]
    fn test_sequential_adds_implicit_edges() {
        let tasks = vec![task("a", &[]), task("b", &[]), task("c", &["a"])];
        let graph = DependencyGraph::from_tasks(&tasks, true).unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
        // Explicit depends_on wins over implicit ordering.
        assert_eq!(graph.dependencies(2), &[0]);
        assert_eq!(graph.roots(), vec![0]);
    }

    #[test]
    fn test_duplicate_dependency_entries_collapse() {
        let graph =
            DependencyGraph::from_tasks(&[task("a", &[]), task("b", &["a", "a"])], false)
                .unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_transitive_closures() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks, false).unwrap();
        assert_eq!(graph.transitive_dependents(0), vec![1, 2]);
        assert_eq!(graph.transitive_dependencies(2), vec![0, 1]);
        assert!(graph.transitive_dependents(3).is_empty());
    }

    #[test]
    fn test_reverse_declared_long_chain() {
        // t0 depends on t1, t1 on t2, ... so the search descends the whole
        // chain from the first task it visits.
        let len = 100_000;
        let tasks: Vec<TaskSpec> = (0..len)
            .map(|i| {
                if i + 1 < len {
                    task(&format!("t{i}"), &[format!("t{}", i + 1).as_str()])
                } else {
                    task(&format!("t{i}"), &[])
                }
            })
            .collect();
        let graph = DependencyGraph::from_tasks(&tasks, false).unwrap();
        assert_eq!(graph.topological_order().first(), Some(&(len - 1)));
        assert_eq!(graph.topological_order().last(), Some(&0));
        assert_eq!(graph.roots(), vec![len - 1]);
    }

    #[test]
    fn test_long_cycle_reports_whole_loop() {
        let len = 50_000;
        let tasks: Vec<TaskSpec> = (0..len)
            .map(|i| task(&format!("t{i}"), &[format!("t{}", (i + 1) % len).as_str()]))
            .collect();
        match DependencyGraph::from_tasks(&tasks, false).unwrap_err() {
            GraphError::CyclicDependency { path } => {
                assert_eq!(path.len(), len + 1);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_fallback_handler_is_ordered_after_sources() {
        let tasks = vec![
            task("fetch", &[]).with_on_error("recover"),
            task("parse", &["fetch"]),
            task("recover", &[]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks, false).unwrap();
        assert_eq!(graph.fallback(0), Some(2));
        assert_eq!(graph.fallback_sources(2), &[0]);
        assert!(graph.is_fallback(2));
        // The handler is not a regular dependent and not a root.
        assert_eq!(graph.dependents(0), &[1]);
        assert_eq!(graph.roots(), vec![0]);
        assert!(position(&graph, "fetch") < position(&graph, "recover"));
    }

    #[test]
    fn test_unknown_fallback_rejected() {
        let err = DependencyGraph::from_tasks(&[task("a", &[]).with_on_error("nope")], false)
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownFallback {
                task: "a".to_string(),
                handler: "nope".to_string(),
            }
        );
    }

    #[test]
    fn test_fallback_loop_is_cycle() {
        // b handles a's failure, yet a waits on b.
        let tasks = vec![
            task("a", &["b"]).with_on_error("b"),
            task("b", &[]),
        ];
        assert!(matches!(
            DependencyGraph::from_tasks(&tasks, false).unwrap_err(),
            GraphError::CyclicDependency { .. }
        ));
        let err = DependencyGraph::from_tasks(&[task("a", &[]).with_on_error("a")], false)
            .unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { .. }));
    }

    #[test]
    fn test_fallback_depending_on_its_source_rejected() {
        let tasks = vec![task("a", &[]).with_on_error("h"), task("h", &["a"])];
        assert_eq!(
            DependencyGraph::from_tasks(&tasks, false).unwrap_err(),
            GraphError::FallbackDependsOnSource {
                handler: "h".to_string(),
                task: "a".to_string(),
            }
        );
    }

    #[test]
    fn test_sequential_skips_handlers_in_implicit_chain() {
        let tasks = vec![
            task("a", &[]).with_on_error("h"),
            task("h", &[]),
            task("b", &[]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks, true).unwrap();
        assert!(graph.dependencies(1).is_empty());
        assert_eq!(graph.dependencies(2), &[0]);
    }
}
