//! Graph construction from disk-loaded units plus recorded applied state.
//!
//! The builder merges the configured unit sources, carries out replacement
//! (squash) resolution against the applied-set snapshot, and produces a
//! validated graph. Replacement resolution may re-point dependencies of
//! in-memory unit copies; the graph is never rebuilt afterwards, so all of
//! that happens before edge construction.

use crate::error::Error;
use crate::graph::MigrationGraph;
use crate::key::MigrationKey;
use crate::unit::MigrationUnit;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Which unit sources are merged into the graph.
///
/// One builder with an explicit mode replaces a tower of loader subclasses;
/// callers pick the universe of nodes, everything downstream is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    /// Per-app units only.
    #[default]
    AppsOnly,
    /// Per-app units plus project-level units.
    Project,
    /// Pending (collected) units plus the dependency closure pulled from the
    /// per-app and project catalogs.
    PendingOverride,
}

/// Explicit build configuration.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    /// Source merge strategy.
    pub mode: SourceMode,
    /// Apps whose migrations are managed at the project level. A dependency
    /// on a project-managed app with no units is an error; a dependency on
    /// any other unit-less app is silently skipped.
    pub project_apps: Vec<String>,
    /// Resolve sentinel dependencies on empty apps to nothing instead of
    /// failing.
    pub tolerate_missing: bool,
}

/// Units gathered from the configured directories, keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct UnitCatalog {
    /// Ordinary per-app units.
    pub app_units: BTreeMap<MigrationKey, MigrationUnit>,
    /// Project-level units.
    pub project_units: BTreeMap<MigrationKey, MigrationUnit>,
    /// Collected units pending application.
    pub pending_units: BTreeMap<MigrationKey, MigrationUnit>,
}

impl UnitCatalog {
    /// Catalog with app units only.
    pub fn from_app_units(units: impl IntoIterator<Item = MigrationUnit>) -> Self {
        let mut catalog = Self::default();
        for unit in units {
            catalog.app_units.insert(unit.key.clone(), unit);
        }
        catalog
    }

    /// Add a project-level unit.
    pub fn with_project_unit(mut self, unit: MigrationUnit) -> Self {
        self.project_units.insert(unit.key.clone(), unit);
        self
    }

    /// Add a pending unit.
    pub fn with_pending_unit(mut self, unit: MigrationUnit) -> Self {
        self.pending_units.insert(unit.key.clone(), unit);
        self
    }
}

/// Constructs a [`BuiltGraph`] from a catalog and an applied-set snapshot.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    config: BuildConfig,
}

/// Result of a successful build: the graph plus the bookkeeping the plan
/// computer and collector need.
#[derive(Debug, Clone)]
pub struct BuiltGraph {
    /// The validated dependency graph.
    pub graph: MigrationGraph,
    /// Applied keys as seen after replacement resolution (squashes absorbed
    /// into their replacement key when their whole range was applied).
    pub applied: BTreeSet<MigrationKey>,
    /// All replacement units seen on disk, whether or not they took effect.
    pub replacements: BTreeMap<MigrationKey, MigrationUnit>,
    /// Replaced key -> candidate squash keys claiming it.
    pub reverse_replacements: BTreeMap<MigrationKey, BTreeSet<MigrationKey>>,
    /// Keys of project or pending units, depending on the source mode.
    pub project_keys: BTreeSet<MigrationKey>,
    /// Apps considered migrated (own at least one unit, or project-managed).
    pub migrated_apps: BTreeSet<String>,
    tolerate_missing: bool,
}

impl GraphBuilder {
    /// Create a builder with the given configuration.
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    /// Build the graph.
    ///
    /// Fails with [`Error::Conflict`] when an app has multiple leaf units,
    /// and with [`Error::MissingDependency`] (or its richer
    /// partially-applied-squash form) when an edge endpoint is absent after
    /// replacement resolution.
    pub fn build(
        &self,
        catalog: UnitCatalog,
        applied: &BTreeSet<MigrationKey>,
    ) -> Result<BuiltGraph, Error> {
        let (disk, project_keys) = self.merge_sources(catalog);

        let mut migrated_apps: BTreeSet<String> =
            disk.keys().map(|key| key.app.clone()).collect();
        migrated_apps.extend(self.config.project_apps.iter().cloned());

        let mut applied = applied.clone();

        // First pass: separate replacing and non-replacing units.
        let mut normal: BTreeMap<MigrationKey, MigrationUnit> = BTreeMap::new();
        let mut replacing: BTreeMap<MigrationKey, MigrationUnit> = BTreeMap::new();
        for (key, unit) in disk {
            if unit.is_replacement() {
                replacing.insert(key, unit);
            } else {
                normal.insert(key, unit);
            }
        }

        // Reverse-dependency index over normal units, used only to re-point
        // edges when a replacement removes their target. run_before is
        // handled separately at edge time and stays out of this index.
        let mut reverse_dependencies: BTreeMap<MigrationKey, BTreeSet<MigrationKey>> =
            BTreeMap::new();
        for (key, unit) in &normal {
            for parent in &unit.dependencies {
                reverse_dependencies
                    .entry(parent.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }

        // Replaced key -> candidate squashes, kept for diagnostics.
        let mut reverse_replacements: BTreeMap<MigrationKey, BTreeSet<MigrationKey>> =
            BTreeMap::new();
        for (key, unit) in &replacing {
            for replaced in &unit.replaces {
                reverse_replacements
                    .entry(replaced.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }

        // Carry out replacements where the whole replaced range is applied or
        // the whole range is unapplied. Sorted key order makes the
        // first-processed-wins rule for overlapping squashes deterministic.
        let replacing_keys: Vec<MigrationKey> = replacing.keys().cloned().collect();
        for key in &replacing_keys {
            // A replacement key recorded as applied must not pre-empt the
            // eligibility check on its replaced range.
            applied.remove(key);

            let replaces = replacing[key].replaces.clone();
            let statuses: Vec<bool> = replaces.iter().map(|t| applied.contains(t)).collect();
            let all_applied = statuses.iter().all(|s| *s);
            let can_replace = all_applied || statuses.iter().all(|s| !*s);
            if !can_replace {
                debug!(squash = %key, "replacement blocked by partially applied range");
                continue;
            }

            for replaced in &replaces {
                // A replaced unit already deleted from disk is fine; squashes
                // outlive their originals.
                normal.remove(replaced);

                let children: Vec<MigrationKey> = reverse_dependencies
                    .get(replaced)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for child_key in children {
                    // Internal edges of a fully replaced range disappear.
                    if replaces.contains(&child_key) {
                        continue;
                    }
                    // The child may itself have been replaced already; update
                    // whichever copies still exist.
                    if let Some(child) = normal.get_mut(&child_key) {
                        repoint_dependency(&mut child.dependencies, replaced, key);
                    }
                    // Candidate squashes of the child depend on the same keys
                    // the child did; keep them (and any promoted copy of
                    // them) in sync.
                    let candidates: Vec<MigrationKey> = reverse_replacements
                        .get(&child_key)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default();
                    for candidate in candidates {
                        let needs_update = replacing
                            .get(&candidate)
                            .map(|unit| unit.dependencies.contains(replaced))
                            .unwrap_or(false);
                        if needs_update {
                            if let Some(unit) = replacing.get_mut(&candidate) {
                                repoint_dependency(&mut unit.dependencies, replaced, key);
                            }
                            if let Some(unit) = normal.get_mut(&candidate) {
                                repoint_dependency(&mut unit.dependencies, replaced, key);
                            }
                        }
                    }
                }
            }

            normal.insert(key.clone(), replacing[key].clone());
            if all_applied {
                applied.insert(key.clone());
                debug!(squash = %key, "replacement absorbed as applied");
            } else {
                debug!(squash = %key, "replacement substituted for unapplied range");
            }
        }

        // Conflicts are fatal before any graph mutation.
        let conflicts = detect_unit_conflicts(&normal);
        if !conflicts.is_empty() {
            return Err(Error::Conflict {
                details: format_conflicts(&conflicts),
            });
        }

        let mut built = BuiltGraph {
            graph: MigrationGraph::new(),
            applied,
            replacements: replacing,
            reverse_replacements,
            project_keys,
            migrated_apps,
            tolerate_missing: self.config.tolerate_missing,
        };

        for unit in normal.values() {
            built.graph.add_node(unit.clone());
        }

        // Same-app dependencies go in first so sentinel resolution sees each
        // app's chain fully connected before cross-app edges are added.
        for (key, unit) in &normal {
            for parent in &unit.dependencies {
                if parent.app != key.app || parent.name == MigrationKey::FIRST {
                    // __first__ references to the same app are ignored.
                    continue;
                }
                if let Err(err) = built.graph.add_dependency(key, parent) {
                    return Err(built.explain_missing_dependency(err));
                }
            }
        }

        for (key, unit) in &normal {
            for parent in &unit.dependencies {
                if parent.app == key.app {
                    // Internal dependencies already added.
                    continue;
                }
                if let Some(parent) = built.resolve_key(parent, &key.app)? {
                    if let Err(err) = built.graph.add_dependency(key, &parent) {
                        return Err(built.explain_missing_dependency(err));
                    }
                }
            }
            // run_before reverses direction: the current unit becomes the
            // parent of the referenced one.
            for child in &unit.run_before {
                if let Some(child) = built.resolve_key(child, &key.app)? {
                    if let Err(err) = built.graph.add_dependency(&child, key) {
                        return Err(built.explain_missing_dependency(err));
                    }
                }
            }
        }

        debug!(
            nodes = built.graph.len(),
            applied = built.applied.len(),
            "migration graph built"
        );
        Ok(built)
    }

    fn merge_sources(
        &self,
        catalog: UnitCatalog,
    ) -> (BTreeMap<MigrationKey, MigrationUnit>, BTreeSet<MigrationKey>) {
        match self.config.mode {
            SourceMode::AppsOnly => (catalog.app_units, BTreeSet::new()),
            SourceMode::Project => {
                let project_keys: BTreeSet<MigrationKey> =
                    catalog.project_units.keys().cloned().collect();
                let mut disk = catalog.app_units;
                disk.extend(catalog.project_units);
                (disk, project_keys)
            }
            SourceMode::PendingOverride => {
                let mut full = catalog.app_units;
                full.extend(catalog.project_units);

                let pending_keys: BTreeSet<MigrationKey> =
                    catalog.pending_units.keys().cloned().collect();
                let mut disk = catalog.pending_units;

                // Pull in the transitive dependency closure of the pending
                // units so the graph is complete. Dependencies on keys not in
                // the full catalog are usually references to other collected
                // units and resolve at edge time.
                let mut stack: Vec<MigrationKey> = disk
                    .values()
                    .flat_map(|unit| unit.dependencies.iter().cloned())
                    .collect();
                let mut seen: BTreeSet<MigrationKey> = BTreeSet::new();
                while let Some(dep) = stack.pop() {
                    if !seen.insert(dep.clone()) {
                        continue;
                    }
                    if let Some(unit) = full.get(&dep) {
                        stack.extend(unit.dependencies.iter().cloned());
                        disk.insert(dep, unit.clone());
                    } else if dep.name == MigrationKey::FIRST {
                        // Expand the sentinel to the referenced app's root.
                        let roots: Vec<(MigrationKey, MigrationUnit)> = full
                            .iter()
                            .filter(|(key, unit)| {
                                key.app == dep.app
                                    && unit.same_app_dependencies().next().is_none()
                            })
                            .map(|(key, unit)| (key.clone(), unit.clone()))
                            .collect();
                        for (key, unit) in roots {
                            stack.extend(unit.dependencies.iter().cloned());
                            disk.insert(key, unit);
                        }
                    }
                }

                (disk, pending_keys)
            }
        }
    }
}

impl BuiltGraph {
    /// Whether the key is recorded applied (post replacement resolution).
    pub fn is_applied(&self, key: &MigrationKey) -> bool {
        self.applied.contains(key)
    }

    /// Apps that have two or more leaf units, with the conflicting names.
    pub fn detect_conflicts(&self) -> BTreeMap<String, Vec<String>> {
        let mut seen: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in self.graph.leaf_nodes(None) {
            seen.entry(key.app).or_default().push(key.name);
        }
        seen.retain(|_, names| names.len() > 1);
        seen
    }

    /// Resolve a dependency key relative to the unit declaring it.
    ///
    /// Sentinel names resolve to the target app's root (`__first__`) or leaf
    /// (`__latest__`). Sentinel references to the declaring unit's own app
    /// are ignored, as are references to apps with no migrations that are
    /// not project-managed. `Ok(None)` means the edge is skipped.
    pub fn resolve_key(
        &self,
        key: &MigrationKey,
        current_app: &str,
    ) -> Result<Option<MigrationKey>, Error> {
        if !key.is_sentinel() || self.graph.contains(key) {
            return Ok(Some(key.clone()));
        }
        if key.app == current_app {
            return Ok(None);
        }
        if !self.migrated_apps.contains(&key.app) {
            return Ok(None);
        }
        let resolved = if key.name == MigrationKey::FIRST {
            self.graph.root_nodes(Some(&key.app)).into_iter().next()
        } else {
            self.graph.leaf_nodes(Some(&key.app)).into_iter().next()
        };
        match resolved {
            Some(found) => Ok(Some(found)),
            None if self.tolerate_missing => Ok(None),
            None => Err(Error::NoMigrations {
                app: key.app.clone(),
            }),
        }
    }

    /// Upgrade a raw missing-dependency error to the partially-applied-squash
    /// diagnostic when some candidate squash claims the missing key but none
    /// of the candidates made it into the graph.
    fn explain_missing_dependency(&self, err: Error) -> Error {
        let Error::MissingDependency { origin, missing } = err else {
            return err;
        };
        if let Some(candidates) = self.reverse_replacements.get(&missing) {
            let is_replaced = candidates.iter().any(|c| self.graph.contains(c));
            if !is_replaced {
                let names: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
                return Error::PartiallyReplacedDependency {
                    origin,
                    missing,
                    candidates: names.join(", "),
                };
            }
        }
        Error::MissingDependency { origin, missing }
    }
}

fn repoint_dependency(
    dependencies: &mut Vec<MigrationKey>,
    from: &MigrationKey,
    to: &MigrationKey,
) {
    dependencies.retain(|dep| dep != from);
    if !dependencies.contains(to) {
        dependencies.push(to.clone());
    }
}

/// Leaf conflicts over the post-replacement unit set: an app with two or
/// more units that nothing in the same app depends on.
fn detect_unit_conflicts(
    normal: &BTreeMap<MigrationKey, MigrationUnit>,
) -> BTreeMap<String, Vec<String>> {
    let mut has_dependent: BTreeSet<&MigrationKey> = BTreeSet::new();
    for unit in normal.values() {
        for dep in unit.same_app_dependencies() {
            has_dependent.insert(dep);
        }
    }
    let mut leaves: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in normal.keys() {
        if !has_dependent.contains(key) {
            leaves.entry(key.app.clone()).or_default().push(key.name.clone());
        }
    }
    leaves.retain(|_, names| names.len() > 1);
    leaves
}

pub(crate) fn format_conflicts(conflicts: &BTreeMap<String, Vec<String>>) -> String {
    conflicts
        .iter()
        .map(|(app, names)| format!("{} in {}", names.join(", "), app))
        .collect::<Vec<_>>()
        .join("; ")
}
