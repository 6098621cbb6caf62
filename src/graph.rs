//! Task graph built from template edges (Arc<str> optimized)
//!
//! Adjacency and predecessor maps over shared task ids, plus the structural
//! checks run at template finalization: acyclicity (via Kahn's algorithm)
//! and reachability of every task from some root. The topological order is
//! computed once and cached; ties are broken by task-id string order so the
//! executor's admission order is stable.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

/// Immutable dependency graph over a template's tasks
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// task_id -> successor task_ids
    adjacency: FxHashMap<Arc<str>, Vec<Arc<str>>>,
    /// task_id -> predecessor task_ids
    predecessors: FxHashMap<Arc<str>, Vec<Arc<str>>>,
    /// All task IDs in insertion order
    task_ids: Vec<Arc<str>>,
    /// Cached stable topological order
    topo_order: Vec<Arc<str>>,
}

/// Structural validation failure, reported by [`TaskGraph::build`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    Empty,
    UnknownEdgeEndpoint { from: String, to: String },
    SelfLoop(String),
    Cycle(Vec<String>),
    Unreachable(Vec<String>),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::Empty => write!(f, "graph has no tasks"),
            GraphError::UnknownEdgeEndpoint { from, to } => {
                write!(f, "edge {from} -> {to} references an unknown task")
            }
            GraphError::SelfLoop(id) => write!(f, "task {id} depends on itself"),
            GraphError::Cycle(ids) => write!(f, "cycle involving tasks: {}", ids.join(", ")),
            GraphError::Unreachable(ids) => {
                write!(f, "tasks unreachable from any root: {}", ids.join(", "))
            }
        }
    }
}

impl TaskGraph {
    /// Build and validate a graph from task ids and (from, to) edges.
    pub fn build(
        task_ids: &[Arc<str>],
        edges: &[(Arc<str>, Arc<str>)],
    ) -> Result<Self, GraphError> {
        if task_ids.is_empty() {
            return Err(GraphError::Empty);
        }

        let task_set: FxHashSet<Arc<str>> = task_ids.iter().cloned().collect();
        let mut adjacency: FxHashMap<Arc<str>, Vec<Arc<str>>> = FxHashMap::default();
        let mut predecessors: FxHashMap<Arc<str>, Vec<Arc<str>>> = FxHashMap::default();

        for id in task_ids {
            adjacency.insert(Arc::clone(id), Vec::new());
            predecessors.insert(Arc::clone(id), Vec::new());
        }

        for (from, to) in edges {
            if !task_set.contains(from) || !task_set.contains(to) {
                return Err(GraphError::UnknownEdgeEndpoint {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            if from == to {
                return Err(GraphError::SelfLoop(from.to_string()));
            }
            adjacency.entry(Arc::clone(from)).or_default().push(Arc::clone(to));
            predecessors.entry(Arc::clone(to)).or_default().push(Arc::clone(from));
        }

        let graph = Self {
            adjacency,
            predecessors,
            task_ids: task_ids.to_vec(),
            topo_order: Vec::new(),
        };

        let topo = graph.topological_sort()?;
        graph.check_reachability()?;

        Ok(Self { topo_order: topo, ..graph })
    }

    /// Kahn's algorithm; ready candidates are drained in task-id order so
    /// the result is deterministic for a given edge set.
    fn topological_sort(&self) -> Result<Vec<Arc<str>>, GraphError> {
        let mut in_degree: FxHashMap<&str, usize> = self
            .task_ids
            .iter()
            .map(|id| (id.as_ref(), self.predecessors[id].len()))
            .collect();

        let mut ready: Vec<Arc<str>> = self
            .task_ids
            .iter()
            .filter(|id| in_degree[id.as_ref()] == 0)
            .cloned()
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.task_ids.len());
        while let Some(next) = ready.first().cloned() {
            ready.remove(0);
            order.push(Arc::clone(&next));

            for succ in &self.adjacency[&next] {
                if let Some(degree) = in_degree.get_mut(succ.as_ref()) {
                    *degree -= 1;
                    if *degree == 0 {
                        let pos = ready.binary_search(succ).unwrap_or_else(|p| p);
                        ready.insert(pos, Arc::clone(succ));
                    }
                }
            }
        }

        if order.len() != self.task_ids.len() {
            let ordered: FxHashSet<&str> = order.iter().map(|id| id.as_ref()).collect();
            let mut cyclic: Vec<String> = self
                .task_ids
                .iter()
                .filter(|id| !ordered.contains(id.as_ref()))
                .map(|id| id.to_string())
                .collect();
            cyclic.sort();
            return Err(GraphError::Cycle(cyclic));
        }

        Ok(order)
    }

    fn check_reachability(&self) -> Result<(), GraphError> {
        let mut seen: FxHashSet<Arc<str>> = FxHashSet::default();
        let mut queue: VecDeque<Arc<str>> = VecDeque::new();

        for root in self.roots() {
            seen.insert(Arc::clone(&root));
            queue.push_back(root);
        }

        while let Some(current) = queue.pop_front() {
            for succ in &self.adjacency[&current] {
                if seen.insert(Arc::clone(succ)) {
                    queue.push_back(Arc::clone(succ));
                }
            }
        }

        let mut unreachable: Vec<String> = self
            .task_ids
            .iter()
            .filter(|id| !seen.contains(id.as_ref()))
            .map(|id| id.to_string())
            .collect();

        if unreachable.is_empty() {
            Ok(())
        } else {
            unreachable.sort();
            Err(GraphError::Unreachable(unreachable))
        }
    }

    /// Tasks with no upstream dependencies
    pub fn roots(&self) -> Vec<Arc<str>> {
        self.task_ids
            .iter()
            .filter(|id| self.predecessors[id.as_ref()].is_empty())
            .cloned()
            .collect()
    }

    /// Upstream dependencies of a task
    #[inline]
    pub fn predecessors(&self, task_id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.predecessors.get(task_id).map(|v| v.as_slice()).unwrap_or(EMPTY)
    }

    /// Downstream successors of a task
    #[inline]
    pub fn successors(&self, task_id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.adjacency.get(task_id).map(|v| v.as_slice()).unwrap_or(EMPTY)
    }

    /// Cached stable topological order
    pub fn topo_order(&self) -> &[Arc<str>] {
        &self.topo_order
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.adjacency.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    /// Check if there's a path from `from` to `to` (BFS)
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }

        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::new();

        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            if let Some(neighbors) = self.adjacency.get(current) {
                for neighbor in neighbors {
                    if neighbor.as_ref() == to {
                        return true;
                    }
                    if visited.insert(neighbor.as_ref()) {
                        queue.push_back(neighbor.as_ref());
                    }
                }
            }
        }

        false
    }
}
