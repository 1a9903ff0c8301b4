//! Install ordering for a feature tree.
//!
//! A parent feature depends on the features it includes, and a patch
//! depends on the feature it patches. [`DependencyGraph::topological_sort`]
//! returns dependencies first so children are stored before their parents.
//!
//! ```
//! use update_model::dependency::DependencyGraph;
//! use update_model::version::VersionedIdentifier;
//!
//! let parent = VersionedIdentifier::parse("org.example.suite", "1.0").unwrap();
//! let child = VersionedIdentifier::parse("org.example.core", "1.0").unwrap();
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_node(parent.clone());
//! graph.add_node(child.clone());
//! graph.add_edge(&parent, &child);
//!
//! assert_eq!(graph.topological_sort().unwrap(), vec![child, parent]);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::feature::Feature;
use crate::version::VersionedIdentifier;

/// Directed graph between features. Edges point from dependent to dependency.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<VersionedIdentifier, BTreeSet<VersionedIdentifier>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: VersionedIdentifier) {
        self.edges.entry(id).or_default();
    }

    /// Declare that `from` depends on `to`. Missing nodes are added.
    pub fn add_edge(&mut self, from: &VersionedIdentifier, to: &VersionedIdentifier) {
        self.edges.entry(to.clone()).or_default();
        self.edges.entry(from.clone()).or_default().insert(to.clone());
    }

    /// Add a feature with edges to its includes and patched bases.
    ///
    /// Only edges to features already in the graph, or added later, take
    /// part in ordering; unrelated bases are added as isolated nodes.
    pub fn add_feature(&mut self, feature: &Feature) {
        let id = feature.identifier().clone();
        self.add_node(id.clone());
        for include in feature.includes() {
            self.add_edge(&id, &include.identifier);
        }
        for import in feature.imports().iter().filter(|import| import.patch) {
            self.add_edge(&id, &import.identifier);
        }
    }

    pub fn node_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, id: &VersionedIdentifier) -> bool {
        self.edges.contains_key(id)
    }

    pub fn dependencies_of(&self, id: &VersionedIdentifier) -> Vec<&VersionedIdentifier> {
        self.edges
            .get(id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Kahn's algorithm, dependencies first. Ties break on identifier order.
    pub fn topological_sort(&self) -> Result<Vec<VersionedIdentifier>> {
        let mut remaining: BTreeMap<&VersionedIdentifier, usize> = self
            .edges
            .iter()
            .map(|(id, deps)| (id, deps.len()))
            .collect();

        let mut dependents: BTreeMap<&VersionedIdentifier, Vec<&VersionedIdentifier>> = BTreeMap::new();
        for (from, deps) in &self.edges {
            for dep in deps {
                dependents.entry(dep).or_default().push(from);
            }
        }

        let mut ready: BTreeSet<&VersionedIdentifier> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.edges.len());
        while let Some(current) = ready.pop_first() {
            order.push(current.clone());
            for dependent in dependents.get(current).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() != self.edges.len() {
            let sorted: BTreeSet<&VersionedIdentifier> = order.iter().collect();
            let participants = self
                .edges
                .keys()
                .filter(|id| !sorted.contains(id))
                .map(ToString::to_string)
                .collect();
            return Err(Error::DependencyCycle { participants });
        }

        Ok(order)
    }
}
