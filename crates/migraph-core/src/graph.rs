//! Migration dependency graph.
//!
//! Nodes are migration keys (after replacement resolution); a directed edge
//! `parent -> child` means the parent must be applied before the child. The
//! graph is expected to be acyclic; plan walks detect violations and fail
//! with [`Error::CircularDependency`].

use crate::error::Error;
use crate::key::MigrationKey;
use crate::unit::MigrationUnit;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Dependency graph over migration units.
#[derive(Debug, Default, Clone)]
pub struct MigrationGraph {
    nodes: BTreeMap<MigrationKey, MigrationUnit>,
    /// child -> parents (keys the child depends on).
    parents: BTreeMap<MigrationKey, BTreeSet<MigrationKey>>,
    /// parent -> children (keys depending on the parent).
    children: BTreeMap<MigrationKey, BTreeSet<MigrationKey>>,
}

impl MigrationGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Replaces any existing unit with the same key.
    pub fn add_node(&mut self, unit: MigrationUnit) {
        self.nodes.insert(unit.key.clone(), unit);
    }

    /// Add an edge meaning `parent` applies before `child`.
    ///
    /// Both endpoints must already be nodes; a missing endpoint is a
    /// [`Error::MissingDependency`] naming `child` as the origin.
    pub fn add_dependency(
        &mut self,
        child: &MigrationKey,
        parent: &MigrationKey,
    ) -> Result<(), Error> {
        for endpoint in [child, parent] {
            if !self.nodes.contains_key(endpoint) {
                return Err(Error::MissingDependency {
                    origin: child.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        self.parents
            .entry(child.clone())
            .or_default()
            .insert(parent.clone());
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        Ok(())
    }

    /// Whether the key is a node.
    pub fn contains(&self, key: &MigrationKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Whether any node belongs to the app.
    pub fn has_app(&self, app: &str) -> bool {
        self.nodes.keys().any(|k| k.app == app)
    }

    /// Look up the unit for a key.
    pub fn unit(&self, key: &MigrationKey) -> Option<&MigrationUnit> {
        self.nodes.get(key)
    }

    /// All node keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &MigrationKey> {
        self.nodes.keys()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct parents of a node.
    pub fn parents_of(&self, key: &MigrationKey) -> impl Iterator<Item = &MigrationKey> {
        self.parents.get(key).into_iter().flatten()
    }

    /// Direct children of a node.
    pub fn children_of(&self, key: &MigrationKey) -> impl Iterator<Item = &MigrationKey> {
        self.children.get(key).into_iter().flatten()
    }

    /// Nodes with no same-app parent, optionally restricted to one app.
    ///
    /// Cross-app dependencies do not disqualify a root; each app's chain has
    /// its own root.
    pub fn root_nodes(&self, app: Option<&str>) -> Vec<MigrationKey> {
        self.boundary_nodes(app, &self.parents)
    }

    /// Nodes with no same-app child, optionally restricted to one app.
    pub fn leaf_nodes(&self, app: Option<&str>) -> Vec<MigrationKey> {
        self.boundary_nodes(app, &self.children)
    }

    fn boundary_nodes(
        &self,
        app: Option<&str>,
        edges: &BTreeMap<MigrationKey, BTreeSet<MigrationKey>>,
    ) -> Vec<MigrationKey> {
        self.nodes
            .keys()
            .filter(|node| app.is_none() || app == Some(node.app.as_str()))
            .filter(|node| {
                edges
                    .get(*node)
                    .map(|linked| !linked.iter().any(|k| k.app == node.app))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Ordered list of nodes to traverse to apply `target`: every ancestor
    /// before its dependents, ending with the target itself.
    pub fn forwards_plan(&self, target: &MigrationKey) -> Result<Vec<MigrationKey>, Error> {
        self.walk(target, &self.parents)
    }

    /// Ordered list of nodes to traverse to unapply `target`: most-dependent
    /// descendants first, ending with the target itself.
    pub fn backwards_plan(&self, target: &MigrationKey) -> Result<Vec<MigrationKey>, Error> {
        self.walk(target, &self.children)
    }

    /// Iterative post-order DFS with cycle detection.
    ///
    /// An explicit stack (instead of recursion) keeps deep chains from
    /// hitting recursion limits.
    fn walk(
        &self,
        start: &MigrationKey,
        edges: &BTreeMap<MigrationKey, BTreeSet<MigrationKey>>,
    ) -> Result<Vec<MigrationKey>, Error> {
        if !self.nodes.contains_key(start) {
            return Err(Error::MissingDependency {
                origin: start.clone(),
                missing: start.clone(),
            });
        }

        let mut order = Vec::new();
        let mut done: HashSet<MigrationKey> = HashSet::new();
        let mut on_path: HashSet<MigrationKey> = HashSet::new();
        // (node, expanded): a node is pushed once to expand its neighbors and
        // once more to emit it after they are done.
        let mut stack: Vec<(MigrationKey, bool)> = vec![(start.clone(), false)];

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                on_path.remove(&node);
                if done.insert(node.clone()) {
                    order.push(node);
                }
                continue;
            }
            if done.contains(&node) {
                continue;
            }
            if !on_path.insert(node.clone()) {
                return Err(Error::CircularDependency { node });
            }
            stack.push((node.clone(), true));
            if let Some(linked) = edges.get(&node) {
                // Reverse so the smallest key is expanded first.
                for next in linked.iter().rev() {
                    if done.contains(next) {
                        continue;
                    }
                    if on_path.contains(next) {
                        return Err(Error::CircularDependency { node: next.clone() });
                    }
                    stack.push((next.clone(), false));
                }
            }
        }

        Ok(order)
    }
}
