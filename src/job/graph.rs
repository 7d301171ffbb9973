//! Declared job dependencies.
//!
//! Edges point from a job to the jobs it depends on. Declarations that
//! would close a cycle are refused, so the graph stays a DAG and a queued
//! job can always eventually be admitted.

use crate::error::{Result, SyncError};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `job_id`'s dependencies, replacing any earlier declaration.
    /// On a cycle nothing changes and the error carries the closing path.
    pub fn declare(&mut self, job_id: &str, depends_on: &[String]) -> Result<()> {
        for dep in depends_on {
            if dep == job_id {
                return Err(SyncError::DependencyCycle {
                    path: vec![job_id.to_string(), job_id.to_string()],
                });
            }
            if let Some(mut path) = self.path(dep, job_id) {
                path.insert(0, job_id.to_string());
                return Err(SyncError::DependencyCycle { path });
            }
        }
        self.edges.insert(job_id.to_string(), depends_on.to_vec());
        Ok(())
    }

    pub fn dependencies(&self, job_id: &str) -> &[String] {
        self.edges.get(job_id).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.edges.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Dependency path `from → … → to`, if one exists.
    fn path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = vec![vec![from.to_string()]];
        while let Some(path) = stack.pop() {
            let Some(node) = path.last() else { continue };
            if node == to {
                return Some(path);
            }
            if !visited.insert(node.clone()) {
                continue;
            }
            for next in self.dependencies(node) {
                if !visited.contains(next) {
                    let mut extended = path.clone();
                    extended.push(next.clone());
                    stack.push(extended);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_chain_is_accepted() {
        let mut g = DependencyGraph::new();
        g.declare("c", &deps(&["b"])).unwrap();
        g.declare("b", &deps(&["a"])).unwrap();
        g.declare("a", &[]).unwrap();
        assert_eq!(g.dependencies("c"), ["b".to_string()]);
        assert!(g.dependencies("unknown").is_empty());
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut g = DependencyGraph::new();
        let err = g.declare("a", &deps(&["a"])).unwrap_err();
        assert!(matches!(err, SyncError::DependencyCycle { ref path } if path == &deps(&["a", "a"])));
        assert!(!g.contains("a"));
    }

    #[test]
    fn test_cycle_reports_path() {
        let mut g = DependencyGraph::new();
        g.declare("b", &deps(&["c"])).unwrap();
        g.declare("c", &deps(&["a"])).unwrap();
        let err = g.declare("a", &deps(&["b"])).unwrap_err();
        match err {
            SyncError::DependencyCycle { path } => assert_eq!(path, deps(&["a", "b", "c", "a"])),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!g.contains("a"), "rejected declaration leaves no trace");
    }

    #[test]
    fn test_cycle_error_display() {
        let mut g = DependencyGraph::new();
        let err = g.declare("x", &deps(&["x"])).unwrap_err();
        assert_eq!(err.to_string(), "Dependency cycle: x -> x");
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut g = DependencyGraph::new();
        g.declare("b", &deps(&["a"])).unwrap();
        g.declare("c", &deps(&["a"])).unwrap();
        g.declare("d", &deps(&["b", "c"])).unwrap();
        assert!(g.declare("a", &[]).is_ok());
    }

    #[test]
    fn test_redeclare_replaces_edges() {
        let mut g = DependencyGraph::new();
        g.declare("a", &deps(&["b"])).unwrap();
        g.declare("a", &[]).unwrap();
        assert!(g.declare("b", &deps(&["a"])).is_ok());
    }
}
