//! A small directed-acyclic-graph checker used to validate task dependency trees before they
//! ever reach the server.

use std::collections::{HashMap, HashSet};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DagError {
    #[error("entity not found")]
    EntityNotFound,

    #[error("entity already exists")]
    EntityExists,

    #[error("edge from {0} to {1} would create a cycle")]
    EdgeCreatesCycle(String, String),
}

/// A graph keyed by node id; edges point from parent to child.
#[derive(Debug, Default)]
pub struct Dag {
    edges: HashMap<String, Vec<String>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: &str) -> Result<(), DagError> {
        if self.edges.contains_key(id) {
            return Err(DagError::EntityExists);
        }

        self.edges.insert(id.to_string(), vec![]);

        Ok(())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    /// Insert an edge from -> to, refusing edges that would make the graph cyclic.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        if !self.edges.contains_key(from) || !self.edges.contains_key(to) {
            return Err(DagError::EntityNotFound);
        }

        if self.edges[from].iter().any(|existing| existing == to) {
            return Err(DagError::EntityExists);
        }

        // If `from` is already reachable from `to` then this new edge closes a loop.
        if self.is_reachable(to, from) {
            return Err(DagError::EdgeCreatesCycle(from.to_string(), to.to_string()));
        }

        self.edges.get_mut(from).unwrap().push(to.to_string());

        Ok(())
    }

    /// Depth-first walk checking whether `target` can be reached starting at `start`.
    fn is_reachable(&self, start: &str, target: &str) -> bool {
        if start == target {
            return true;
        }

        let mut visited = HashSet::new();
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }

            let Some(children) = self.edges.get(node) else {
                continue;
            };

            for child in children {
                if child == target {
                    return true;
                }

                stack.push(child);
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_simple_dag() {
        let mut dag = Dag::new();

        dag.add_node("one").unwrap();
        dag.add_node("two").unwrap();
        dag.add_edge("one", "two").unwrap();

        assert!(dag.exists("one"));
        assert!(!dag.exists("three"));
    }

    #[test]
    fn detects_cycles() {
        let mut dag = Dag::new();

        for id in ["one", "two", "three", "four", "five", "six"] {
            dag.add_node(id).unwrap();
        }

        dag.add_edge("one", "two").unwrap();
        dag.add_edge("two", "three").unwrap();
        dag.add_edge("two", "four").unwrap();
        dag.add_edge("four", "five").unwrap();
        dag.add_edge("five", "six").unwrap();

        let err = dag.add_edge("six", "four").unwrap_err();
        assert_eq!(
            err,
            DagError::EdgeCreatesCycle("six".to_string(), "four".to_string())
        );

        // A diamond that reconverges is still acyclic.
        dag.add_edge("six", "three").unwrap();
    }

    #[test]
    fn rejects_self_edges() {
        let mut dag = Dag::new();

        dag.add_node("one").unwrap();

        let err = dag.add_edge("one", "one").unwrap_err();
        assert_eq!(
            err,
            DagError::EdgeCreatesCycle("one".to_string(), "one".to_string())
        );
    }

    #[test]
    fn unknown_nodes_are_rejected() {
        let mut dag = Dag::new();

        dag.add_node("one").unwrap();

        assert_eq!(
            dag.add_edge("one", "missing").unwrap_err(),
            DagError::EntityNotFound
        );
    }
}
