//! Subtask dependency graph.
//!
//! Nodes are subtasks, edges point from a dependency to its dependent.
//! The graph is built from the decomposer's ordered list, where a subtask
//! may only depend on subtasks declared before it, so it is acyclic by
//! construction; `add_dependency` still checks and rejects cycles.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::plan::Subtask;
use crate::error::{Error, Result};

pub struct SubtaskGraph {
    graph: DiGraph<Subtask, ()>,
    index: HashMap<String, NodeIndex>,
}

impl SubtaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build from an ordered subtask list.
    ///
    /// # Errors
    /// Returns `Validation` on duplicate ids, unknown dependencies, or a
    /// dependency on a subtask declared later in the list.
    pub fn from_subtasks(subtasks: &[Subtask]) -> Result<Self> {
        let mut dag = Self::new();
        for subtask in subtasks {
            if dag.index.contains_key(&subtask.id) {
                return Err(Error::Validation(format!(
                    "duplicate subtask id: {}",
                    subtask.id
                )));
            }
            for dep in &subtask.depends_on {
                if dep == &subtask.id {
                    return Err(Error::Validation(format!(
                        "subtask {} depends on itself",
                        subtask.id
                    )));
                }
                if !dag.index.contains_key(dep) {
                    let later = subtasks.iter().any(|s| &s.id == dep);
                    return Err(Error::Validation(if later {
                        format!("subtask {} references later subtask {}", subtask.id, dep)
                    } else {
                        format!("subtask {} references unknown subtask {}", subtask.id, dep)
                    }));
                }
            }
            dag.add_subtask(subtask.clone());
            for dep in &subtask.depends_on {
                dag.add_dependency(dep, &subtask.id)?;
            }
        }
        Ok(dag)
    }

    /// Add a subtask. An existing id returns the existing node.
    pub fn add_subtask(&mut self, subtask: Subtask) -> NodeIndex {
        if let Some(&index) = self.index.get(&subtask.id) {
            return index;
        }
        let id = subtask.id.clone();
        let index = self.graph.add_node(subtask);
        self.index.insert(id, index);
        index
    }

    /// `from` must complete before `to` can start.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        let from_index = *self
            .index
            .get(from)
            .ok_or_else(|| Error::Validation(format!("Subtask {} not found", from)))?;
        let to_index = *self
            .index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Subtask {} not found", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.index.get(id).and_then(|&i| self.graph.node_weight(i))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    pub fn dependencies(&self, id: &str) -> Vec<&Subtask> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn dependents(&self, id: &str) -> Vec<&Subtask> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, dir: Direction) -> Vec<&Subtask> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, dir)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Subtasks not in `completed` whose dependencies all are.
    pub fn ready<'a>(&'a self, completed: &HashSet<String>) -> Vec<&'a Subtask> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let subtask = self.graph.node_weight(index)?;
                if completed.contains(&subtask.id) {
                    return None;
                }
                let deps_done = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| completed.contains(&d.id))
                            .unwrap_or(false)
                    });
                deps_done.then_some(subtask)
            })
            .collect()
    }

    /// Kahn-style leveling: each level holds every subtask whose
    /// dependencies sit in earlier levels. Ids keep declaration order.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut completed = HashSet::new();
        let mut levels = Vec::new();
        loop {
            let mut level: Vec<NodeIndex> = self
                .ready(&completed)
                .into_iter()
                .filter_map(|s| self.index.get(&s.id).copied())
                .collect();
            if level.is_empty() {
                break;
            }
            level.sort();
            let ids: Vec<String> = level
                .iter()
                .filter_map(|&i| self.graph.node_weight(i).map(|s| s.id.clone()))
                .collect();
            completed.extend(ids.iter().cloned());
            levels.push(ids);
        }
        levels
    }

    /// Subtasks ordered so every dependency precedes its dependents.
    pub fn topological_order(&self) -> Result<Vec<&Subtask>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|s| s.id.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at subtask: {}", id))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .collect())
    }

    /// Longest cumulative-duration chain and its length in minutes.
    pub fn critical_path(&self) -> Result<(Vec<String>, u32)> {
        let order: Vec<NodeIndex> = self
            .topological_order()?
            .into_iter()
            .filter_map(|s| self.index.get(&s.id).copied())
            .collect();

        let mut finish: HashMap<NodeIndex, u32> = HashMap::new();
        let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        for &node in &order {
            let own = self.graph[node].estimated_minutes;
            let best = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|dep| finish.get(&dep).map(|&f| (dep, f)))
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)));
            match best {
                Some((dep, f)) => {
                    finish.insert(node, f + own);
                    prev.insert(node, dep);
                }
                None => {
                    finish.insert(node, own);
                }
            }
        }

        let end = finish
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&n, &f)| (n, f));
        let Some((mut node, total)) = end else {
            return Ok((Vec::new(), 0));
        };

        let mut path = vec![self.graph[node].id.clone()];
        while let Some(&p) = prev.get(&node) {
            path.push(self.graph[p].id.clone());
            node = p;
        }
        path.reverse();
        Ok((path, total))
    }

    pub fn total_minutes(&self) -> u32 {
        self.graph.node_weights().map(|s| s.estimated_minutes).sum()
    }
}

impl Default for SubtaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubtaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtaskGraph")
            .field("subtasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
