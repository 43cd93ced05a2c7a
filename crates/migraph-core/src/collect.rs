//! Consolidation of unapplied migrations into project-level units.
//!
//! The collector walks each app's unapplied range, partitions it into groups
//! that will not introduce dependency cycles once squashed, and emits one
//! consolidated replacement unit per group. Naive per-app squashing is unsafe
//! when two apps' unapplied ranges interleave through cross-app dependencies:
//! the per-unit graph had no cycle, but the squashed one would. Groups are
//! split until the consolidated units themselves form an acyclic graph.

use crate::build::{format_conflicts, BuiltGraph};
use crate::error::Error;
use crate::key::MigrationKey;
use crate::optimize::OperationOptimizer;
use crate::unit::MigrationUnit;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Consolidated units per app, in emission (and numbering) order.
pub type CollectedUnits = BTreeMap<String, Vec<MigrationUnit>>;

/// Group identity while splitting: app label plus position in the app's
/// group list (most ancestral group first).
type GroupId = (String, usize);

/// Builds consolidated replacement units from a built graph.
#[derive(Debug, Clone)]
pub struct Collector {
    optimize: bool,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    /// Create a collector with operation optimization enabled.
    pub fn new() -> Self {
        Self { optimize: true }
    }

    /// Disable the operation optimizer pass.
    pub fn without_optimization(mut self) -> Self {
        self.optimize = false;
        self
    }

    /// Collect the unapplied range of every app into consolidated units.
    ///
    /// Fails with [`Error::Conflict`] when an app has multiple leaves, and
    /// with [`Error::SelfDependency`] if dependency repair would make a
    /// consolidated unit depend on itself (a split-boundary bug, never
    /// ignored).
    pub fn collect(&self, built: &BuiltGraph) -> Result<CollectedUnits, Error> {
        let conflicts = built.detect_conflicts();
        if !conflicts.is_empty() {
            return Err(Error::Conflict {
                details: format_conflicts(&conflicts),
            });
        }

        let leaves: BTreeSet<MigrationKey> =
            built.graph.leaf_nodes(None).into_iter().collect();

        // One group per app to start with, newest unit first.
        let mut groups: BTreeMap<String, Vec<Vec<MigrationKey>>> = BTreeMap::new();
        let mut app_leaves: BTreeMap<String, MigrationKey> = BTreeMap::new();
        for leaf in &leaves {
            if built.is_applied(leaf) {
                continue;
            }
            let group = unapplied_group(built, &leaf.app, leaf);
            if group.is_empty() {
                continue;
            }
            app_leaves.insert(leaf.app.clone(), leaf.clone());
            groups.insert(leaf.app.clone(), vec![group]);
        }
        if groups.is_empty() {
            return Ok(CollectedUnits::new());
        }

        self.split_at_common_ancestors(built, &mut groups, &app_leaves, &leaves)?;
        self.split_remaining_cycles(built, &mut groups)?;

        let consolidated = self.consolidate(built, &groups);
        let repaired = repair_dependencies(built, &groups, consolidated)?;

        debug!(
            apps = repaired.len(),
            units = repaired.values().map(Vec::len).sum::<usize>(),
            "migrations collected"
        );
        Ok(repaired)
    }

    /// Split groups at the most recently common ancestor of each dependent
    /// app pair, so the ancestral range can be consolidated separately from
    /// the range the other app's units sit between.
    fn split_at_common_ancestors(
        &self,
        built: &BuiltGraph,
        groups: &mut BTreeMap<String, Vec<Vec<MigrationKey>>>,
        app_leaves: &BTreeMap<String, MigrationKey>,
        leaves: &BTreeSet<MigrationKey>,
    ) -> Result<(), Error> {
        let apps: Vec<String> = groups.keys().cloned().collect();

        for (i, app_a) in apps.iter().enumerate() {
            for app_b in &apps[i + 1..] {
                let leaf_a = &app_leaves[app_a];
                let leaf_b = &app_leaves[app_b];
                if !share_dependencies(built, leaf_a, leaf_b, &apps)? {
                    continue;
                }
                let Some(ancestor) = common_ancestor(built, leaf_a, leaf_b, leaves)? else {
                    continue;
                };
                let Some(app_groups) = groups.get_mut(&ancestor.app) else {
                    continue;
                };
                for group_idx in 0..app_groups.len() {
                    let Some(idx) = app_groups[group_idx]
                        .iter()
                        .position(|key| key == &ancestor)
                    else {
                        continue;
                    };
                    if idx > 0 {
                        // The ancestral tail becomes its own group, emitted
                        // (and numbered) before everything else.
                        let tail = app_groups[group_idx].split_off(idx);
                        debug!(app = %ancestor.app, at = %ancestor, "split at common ancestor");
                        app_groups.insert(0, tail);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Keep splitting until the group-level dependency graph is acyclic.
    ///
    /// The pairwise ancestor split covers the common interleave; ranges that
    /// cross-depend in both directions need further cuts. Each pass either
    /// finds no cycle, performs one split (strictly increasing the group
    /// count, so this terminates), or fails because the cycle cannot be
    /// broken at group granularity.
    fn split_remaining_cycles(
        &self,
        built: &BuiltGraph,
        groups: &mut BTreeMap<String, Vec<Vec<MigrationKey>>>,
    ) -> Result<(), Error> {
        loop {
            let locate = locate_members(groups);
            let successors = group_edges(built, groups, &locate);
            let Some(cycle) = find_group_cycle(&successors) else {
                return Ok(());
            };

            let mut split = false;
            for pos in 0..cycle.len() {
                let pred = &cycle[pos];
                let succ = &cycle[(pos + 1) % cycle.len()];
                if self.split_edge(built, groups, &locate, pred, succ)? {
                    split = true;
                    break;
                }
            }
            if !split {
                // Every edge in the cycle needs the whole predecessor group,
                // which would mean the unit-level graph already cycled.
                let node = cycle
                    .first()
                    .and_then(|(app, idx)| groups[app][*idx].first().cloned())
                    .unwrap_or_else(|| MigrationKey::new("", ""));
                return Err(Error::CircularDependency { node });
            }
        }
    }

    /// Cut `pred` down to the part `succ` actually depends on.
    ///
    /// The cut is the ancestral closure (within `pred`) of the keys `succ`
    /// references; if that is a proper subset, it becomes an earlier group
    /// and the remainder can safely follow `succ`.
    fn split_edge(
        &self,
        built: &BuiltGraph,
        groups: &mut BTreeMap<String, Vec<Vec<MigrationKey>>>,
        locate: &BTreeMap<MigrationKey, GroupId>,
        pred: &GroupId,
        succ: &GroupId,
    ) -> Result<bool, Error> {
        let members: BTreeSet<MigrationKey> =
            groups[&pred.0][pred.1].iter().cloned().collect();

        let mut cut: BTreeSet<MigrationKey> = BTreeSet::new();
        for key in &groups[&succ.0][succ.1] {
            let parents: Vec<MigrationKey> =
                built.graph.parents_of(key).cloned().collect();
            for parent in parents {
                if locate.get(&parent) != Some(pred) {
                    continue;
                }
                for ancestor in built.graph.forwards_plan(&parent)? {
                    if members.contains(&ancestor) {
                        cut.insert(ancestor);
                    }
                }
            }
        }
        if cut.is_empty() || cut.len() == members.len() {
            return Ok(false);
        }

        let Some(app_groups) = groups.get_mut(&pred.0) else {
            return Ok(false);
        };
        let group = app_groups.remove(pred.1);
        let (ancestral, remainder): (Vec<MigrationKey>, Vec<MigrationKey>) =
            group.into_iter().partition(|key| cut.contains(key));
        debug!(app = %pred.0, "split to break consolidated cycle");
        app_groups.insert(pred.1, remainder);
        app_groups.insert(pred.1, ancestral);
        Ok(true)
    }

    /// Turn each group into one consolidated replacement unit.
    fn consolidate(
        &self,
        built: &BuiltGraph,
        groups: &BTreeMap<String, Vec<Vec<MigrationKey>>>,
    ) -> CollectedUnits {
        let optimizer = OperationOptimizer::new();
        let mut result = CollectedUnits::new();

        for (app, app_groups) in groups {
            for (idx, group) in app_groups.iter().enumerate() {
                let replaces: BTreeSet<MigrationKey> = group.iter().cloned().collect();

                let mut operations = Vec::new();
                let mut dependencies: BTreeSet<MigrationKey> = BTreeSet::new();
                let mut initial = false;
                // Groups are newest-first; reversing restores chronological
                // operation order.
                for key in group.iter().rev() {
                    let Some(unit) = built.graph.unit(key) else {
                        continue;
                    };
                    operations.extend(unit.operations.iter().cloned());
                    initial |= unit.initial;
                    for dep in &unit.dependencies {
                        // Same-app dependencies inside the group collapse
                        // away; the group becomes a single unit.
                        if dep.app != key.app || !replaces.contains(dep) {
                            dependencies.insert(dep.clone());
                        }
                    }
                }

                if self.optimize {
                    let before = operations.len();
                    operations = optimizer.optimize(operations);
                    if operations.len() < before {
                        debug!(
                            app = %app,
                            before,
                            after = operations.len(),
                            "optimized consolidated operations"
                        );
                    }
                }

                let mut unit = MigrationUnit::new(MigrationKey::new(app, unit_name(idx)));
                unit.replaces = replaces.into_iter().collect();
                unit.dependencies = dependencies.into_iter().collect();
                unit.operations = operations;
                unit.initial = initial;
                result.entry(app.clone()).or_default().push(unit);
            }
        }
        result
    }
}

/// 1-based fixed-width name for a consolidated unit.
fn unit_name(idx: usize) -> String {
    format!("{:04}_project", idx + 1)
}

/// Same-app unapplied units reachable from the app's leaf, newest first.
fn unapplied_group(built: &BuiltGraph, app: &str, leaf: &MigrationKey) -> Vec<MigrationKey> {
    let mut group = Vec::new();
    let mut seen: BTreeSet<MigrationKey> = BTreeSet::new();
    let mut stack = vec![leaf.clone()];

    while let Some(node) = stack.pop() {
        if !seen.insert(node.clone()) {
            continue;
        }
        if built.is_applied(&node) {
            continue;
        }
        if node.app == app {
            group.push(node.clone());
        }
        let parents: Vec<MigrationKey> = built.graph.parents_of(&node).cloned().collect();
        for parent in parents.into_iter().rev() {
            stack.push(parent);
        }
    }
    group
}

/// Whether two leaves' ancestor closures touch any common candidate app.
fn share_dependencies(
    built: &BuiltGraph,
    leaf_a: &MigrationKey,
    leaf_b: &MigrationKey,
    candidate_apps: &[String],
) -> Result<bool, Error> {
    let apps_of = |leaf: &MigrationKey| -> Result<BTreeSet<String>, Error> {
        let mut plan = built.graph.forwards_plan(leaf)?;
        plan.pop();
        Ok(plan
            .into_iter()
            .map(|key| key.app)
            .filter(|app| candidate_apps.contains(app))
            .collect())
    };
    let apps_a = apps_of(leaf_a)?;
    let apps_b = apps_of(leaf_b)?;
    Ok(apps_a.intersection(&apps_b).next().is_some())
}

/// Most recently common ancestor of two leaves.
///
/// Each leaf's forward plan, with applied nodes and leaves filtered out, is
/// its ancestry; scanning both from the root end, the last position where
/// they still agree is the split point.
fn common_ancestor(
    built: &BuiltGraph,
    leaf_a: &MigrationKey,
    leaf_b: &MigrationKey,
    leaves: &BTreeSet<MigrationKey>,
) -> Result<Option<MigrationKey>, Error> {
    let ancestry = |leaf: &MigrationKey| -> Result<Vec<MigrationKey>, Error> {
        Ok(built
            .graph
            .forwards_plan(leaf)?
            .into_iter()
            .filter(|node| !built.is_applied(node) && !leaves.contains(node))
            .collect())
    };
    let ancestry_a = ancestry(leaf_a)?;
    let ancestry_b = ancestry(leaf_b)?;

    let mut common = None;
    for (a, b) in ancestry_a.iter().zip(ancestry_b.iter()) {
        if a != b {
            break;
        }
        common = Some(a.clone());
    }
    Ok(common)
}

/// Map every group member to its group.
fn locate_members(
    groups: &BTreeMap<String, Vec<Vec<MigrationKey>>>,
) -> BTreeMap<MigrationKey, GroupId> {
    let mut locate = BTreeMap::new();
    for (app, app_groups) in groups {
        for (idx, group) in app_groups.iter().enumerate() {
            for key in group {
                locate.insert(key.clone(), (app.clone(), idx));
            }
        }
    }
    locate
}

/// Group-level dependency edges, predecessor to successors.
fn group_edges(
    built: &BuiltGraph,
    groups: &BTreeMap<String, Vec<Vec<MigrationKey>>>,
    locate: &BTreeMap<MigrationKey, GroupId>,
) -> BTreeMap<GroupId, BTreeSet<GroupId>> {
    let mut successors: BTreeMap<GroupId, BTreeSet<GroupId>> = BTreeMap::new();
    for (app, app_groups) in groups {
        for (idx, group) in app_groups.iter().enumerate() {
            let id = (app.clone(), idx);
            successors.entry(id.clone()).or_default();
            for key in group {
                for parent in built.graph.parents_of(key) {
                    if let Some(pred) = locate.get(parent) {
                        if pred != &id {
                            successors
                                .entry(pred.clone())
                                .or_default()
                                .insert(id.clone());
                        }
                    }
                }
            }
        }
    }
    successors
}

/// Find one cycle among groups, as the list of groups on it.
fn find_group_cycle(
    successors: &BTreeMap<GroupId, BTreeSet<GroupId>>,
) -> Option<Vec<GroupId>> {
    let mut done: BTreeSet<GroupId> = BTreeSet::new();

    for start in successors.keys() {
        if done.contains(start) {
            continue;
        }
        let mut stack: Vec<(GroupId, bool)> = vec![(start.clone(), false)];
        let mut path: Vec<GroupId> = Vec::new();
        let mut on_path: BTreeSet<GroupId> = BTreeSet::new();

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                on_path.remove(&node);
                path.pop();
                done.insert(node);
                continue;
            }
            if done.contains(&node) || on_path.contains(&node) {
                continue;
            }
            on_path.insert(node.clone());
            path.push(node.clone());
            stack.push((node.clone(), true));
            for next in successors.get(&node).into_iter().flatten() {
                if on_path.contains(next) {
                    let pos = path.iter().position(|p| p == next)?;
                    return Some(path[pos..].to_vec());
                }
                if !done.contains(next) {
                    stack.push((next.clone(), false));
                }
            }
        }
    }
    None
}

/// Rewrite dependencies that point into another group's replaced range so
/// they target the consolidated unit instead.
fn repair_dependencies(
    built: &BuiltGraph,
    groups: &BTreeMap<String, Vec<Vec<MigrationKey>>>,
    mut units: CollectedUnits,
) -> Result<CollectedUnits, Error> {
    let locate = locate_members(groups);
    let apps: Vec<String> = units.keys().cloned().collect();

    for app in &apps {
        for idx in 0..units[app].len() {
            let own_key = units[app][idx].key.clone();
            let deps: Vec<MigrationKey> = units[app][idx].dependencies.clone();
            for dep in deps {
                let resolved = built
                    .resolve_key(&dep, app)?
                    .unwrap_or_else(|| dep.clone());
                let Some((dep_app, dep_idx)) = locate.get(&resolved) else {
                    continue;
                };
                let replacement = MigrationKey::new(dep_app, unit_name(*dep_idx));
                if replacement == own_key {
                    return Err(Error::SelfDependency { node: own_key });
                }
                let covered = units
                    .get(dep_app)
                    .and_then(|list| list.get(*dep_idx))
                    .map(|other| other.replaces.contains(&resolved))
                    .unwrap_or(false);
                if !covered {
                    continue;
                }
                if let Some(list) = units.get_mut(app) {
                    let unit = &mut list[idx];
                    unit.dependencies.retain(|d| d != &dep);
                    if !unit.dependencies.contains(&replacement) {
                        unit.dependencies.push(replacement);
                    }
                }
            }
        }
    }
    Ok(units)
}
