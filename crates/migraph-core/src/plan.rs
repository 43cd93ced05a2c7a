//! Execution plan computation.
//!
//! Given a built graph and a set of targets, produces the ordered sequence
//! of (migration, direction) steps the external executor should run. The
//! engine only computes the plan; applying operations and updating the
//! recorder belong to the executor.

use crate::build::BuiltGraph;
use crate::error::Error;
use crate::key::MigrationKey;
use crate::recorder::MigrationRecorder;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Direction of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Apply the migration.
    Apply,
    /// Revert the migration.
    Unapply,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Apply => write!(f, "apply"),
            Direction::Unapply => write!(f, "unapply"),
        }
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    /// The migration to run.
    pub key: MigrationKey,
    /// Whether to apply or unapply it.
    pub direction: Direction,
}

impl PlanStep {
    fn apply(key: MigrationKey) -> Self {
        Self {
            key,
            direction: Direction::Apply,
        }
    }

    fn unapply(key: MigrationKey) -> Self {
        Self {
            key,
            direction: Direction::Unapply,
        }
    }
}

/// A plan target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanTarget {
    /// Reach exactly this migration, applying or unapplying as needed.
    Key(MigrationKey),
    /// Unapply every migration of the app.
    App(String),
}

impl std::fmt::Display for PlanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanTarget::Key(key) => write!(f, "{key}"),
            PlanTarget::App(app) => write!(f, "{app} (all)"),
        }
    }
}

/// Compute the ordered plan to reach `targets` from the current applied
/// state.
///
/// Per-target closures are concatenated; a working copy of the applied set
/// is updated as steps are emitted, so a step needed by several targets is
/// kept at its first (earliest) position and never re-emitted.
pub fn plan(built: &BuiltGraph, targets: &[PlanTarget]) -> Result<Vec<PlanStep>, Error> {
    let graph = &built.graph;
    let mut working: BTreeSet<MigrationKey> = built.applied.clone();
    let mut steps = Vec::new();

    for target in targets {
        match target {
            PlanTarget::App(app) => {
                for root in graph.root_nodes(Some(app)) {
                    for key in graph.backwards_plan(&root)? {
                        if working.remove(&key) {
                            steps.push(PlanStep::unapply(key));
                        }
                    }
                }
            }
            PlanTarget::Key(key) => {
                if !graph.contains(key) {
                    if !graph.has_app(&key.app) {
                        return Err(Error::UnresolvableTarget {
                            app: key.app.clone(),
                            name: key.name.clone(),
                        });
                    }
                    if working.iter().any(|k| k.app == key.app) {
                        return Err(Error::UnresolvableTarget {
                            app: key.app.clone(),
                            name: key.name.clone(),
                        });
                    }
                    // Unknown key for an app with nothing applied: no-op.
                    debug!(target = %key, "target absent from graph, nothing to do");
                    continue;
                }
                if working.contains(key) {
                    // Roll back through the target's same-app children only,
                    // never the target itself; unrelated apps stay put.
                    let next_in_app: BTreeSet<MigrationKey> = graph
                        .children_of(key)
                        .filter(|child| child.app == key.app)
                        .cloned()
                        .collect();
                    for child in next_in_app {
                        for key in graph.backwards_plan(&child)? {
                            if working.remove(&key) {
                                steps.push(PlanStep::unapply(key));
                            }
                        }
                    }
                } else {
                    for key in graph.forwards_plan(key)? {
                        if !working.contains(&key) {
                            working.insert(key.clone());
                            steps.push(PlanStep::apply(key));
                        }
                    }
                }
            }
        }
    }

    debug!(targets = targets.len(), steps = steps.len(), "plan computed");
    Ok(steps)
}

/// Record the outcome of one executed plan step.
///
/// Applying a replacement unit records its replaced keys as applied too, so
/// a later rebuild sees the whole range applied and absorbs the squash;
/// unapplying removes them again.
pub fn record_step<R: MigrationRecorder + ?Sized>(
    recorder: &mut R,
    built: &BuiltGraph,
    step: &PlanStep,
) -> Result<(), Error> {
    let replaced: Vec<MigrationKey> = built
        .graph
        .unit(&step.key)
        .map(|unit| unit.replaces.clone())
        .unwrap_or_default();
    match step.direction {
        Direction::Apply => {
            recorder.record_applied(&step.key)?;
            for key in &replaced {
                recorder.record_applied(key)?;
            }
        }
        Direction::Unapply => {
            recorder.record_unapplied(&step.key)?;
            for key in &replaced {
                recorder.record_unapplied(key)?;
            }
        }
    }
    Ok(())
}

/// Targets for applying the project/pending migrations: the graph's leaves
/// restricted to project keys.
pub fn apply_targets(built: &BuiltGraph) -> Vec<PlanTarget> {
    built
        .graph
        .leaf_nodes(None)
        .into_iter()
        .filter(|key| built.project_keys.contains(key))
        .map(PlanTarget::Key)
        .collect()
}

/// Targets for unapplying the project/pending migrations.
///
/// Per app, the state to roll back to is the oldest project unit's same-app
/// dependency; when it has none the whole app unapplies. Later project units
/// of the same app only depend on earlier ones and contribute no target of
/// their own.
pub fn unapply_targets(built: &BuiltGraph) -> Vec<PlanTarget> {
    let mut oldest: BTreeMap<&str, &MigrationKey> = BTreeMap::new();
    for key in &built.project_keys {
        oldest.entry(key.app.as_str()).or_insert(key);
    }

    let mut targets = Vec::new();
    for (app, key) in oldest {
        let same_app: Vec<MigrationKey> = built
            .graph
            .unit(key)
            .map(|unit| unit.same_app_dependencies().cloned().collect())
            .unwrap_or_default();
        if same_app.is_empty() {
            targets.push(PlanTarget::App(app.to_string()));
        } else {
            targets.extend(same_app.into_iter().map(PlanTarget::Key));
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildConfig, GraphBuilder, SourceMode, UnitCatalog};
    use crate::recorder::MemoryRecorder;
    use crate::unit::MigrationUnit;

    fn key(app: &str, name: &str) -> MigrationKey {
        MigrationKey::new(app, name)
    }

    fn unit(app: &str, name: &str) -> MigrationUnit {
        MigrationUnit::new(key(app, name))
    }

    fn chain_catalog() -> UnitCatalog {
        UnitCatalog::from_app_units([
            unit("a", "0001"),
            unit("a", "0002").with_dependency(("a", "0001")),
            unit("a", "0003").with_dependency(("a", "0002")),
        ])
    }

    fn build(catalog: UnitCatalog, applied: &[(&str, &str)]) -> BuiltGraph {
        let applied = applied.iter().map(|(a, n)| key(a, n)).collect();
        GraphBuilder::default().build(catalog, &applied).unwrap()
    }

    #[test]
    fn test_apply_linear_chain_from_scratch() {
        let built = build(chain_catalog(), &[]);
        let steps = plan(&built, &[PlanTarget::Key(key("a", "0003"))]).unwrap();

        let expected: Vec<PlanStep> = ["0001", "0002", "0003"]
            .iter()
            .map(|n| PlanStep::apply(key("a", n)))
            .collect();
        assert_eq!(steps, expected);
    }

    #[test]
    fn test_unapply_back_to_root() {
        let built = build(chain_catalog(), &[("a", "0001"), ("a", "0002"), ("a", "0003")]);
        let steps = plan(&built, &[PlanTarget::Key(key("a", "0001"))]).unwrap();

        // Rolls back to (but not including) the target.
        let expected: Vec<PlanStep> = ["0003", "0002"]
            .iter()
            .map(|n| PlanStep::unapply(key("a", n)))
            .collect();
        assert_eq!(steps, expected);
    }

    #[test]
    fn test_unapply_whole_app() {
        let built = build(chain_catalog(), &[("a", "0001"), ("a", "0002"), ("a", "0003")]);
        let steps = plan(&built, &[PlanTarget::App("a".to_string())]).unwrap();

        let expected: Vec<PlanStep> = ["0003", "0002", "0001"]
            .iter()
            .map(|n| PlanStep::unapply(key("a", n)))
            .collect();
        assert_eq!(steps, expected);
    }

    #[test]
    fn test_cross_app_target_ordering() {
        let catalog = UnitCatalog::from_app_units([
            unit("cookbook", "0001"),
            unit("cookbook", "0002").with_dependency(("cookbook", "0001")),
            unit("blog", "0001").with_dependency(("cookbook", "0002")),
        ]);
        let built = build(catalog, &[]);

        let steps = plan(
            &built,
            &[
                PlanTarget::Key(key("blog", "0001")),
                PlanTarget::Key(key("cookbook", "0002")),
            ],
        )
        .unwrap();

        let expected = vec![
            PlanStep::apply(key("cookbook", "0001")),
            PlanStep::apply(key("cookbook", "0002")),
            PlanStep::apply(key("blog", "0001")),
        ];
        assert_eq!(steps, expected);
    }

    #[test]
    fn test_merged_targets_keep_first_occurrence() {
        let built = build(chain_catalog(), &[]);
        let steps = plan(
            &built,
            &[
                PlanTarget::Key(key("a", "0002")),
                PlanTarget::Key(key("a", "0003")),
            ],
        )
        .unwrap();

        // 0001/0002 were already planned by the first target and are not
        // re-emitted by the second.
        let expected: Vec<PlanStep> = ["0001", "0002", "0003"]
            .iter()
            .map(|n| PlanStep::apply(key("a", n)))
            .collect();
        assert_eq!(steps, expected);
    }

    #[test]
    fn test_already_applied_target_with_no_children_is_noop() {
        let built = build(chain_catalog(), &[("a", "0001")]);
        // 0001 is applied, its child 0002 is not; rolling back "to 0001" has
        // nothing to undo.
        let steps = plan(&built, &[PlanTarget::Key(key("a", "0001"))]).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn test_unknown_key_with_nothing_applied_is_noop() {
        let built = build(chain_catalog(), &[]);
        let steps = plan(&built, &[PlanTarget::Key(key("a", "9999"))]).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn test_unknown_key_with_applied_state_is_unresolvable() {
        let built = build(chain_catalog(), &[("a", "0001")]);
        let err = plan(&built, &[PlanTarget::Key(key("a", "9999"))]).unwrap_err();
        assert!(matches!(err, Error::UnresolvableTarget { .. }));
    }

    #[test]
    fn test_unknown_app_is_unresolvable() {
        let built = build(chain_catalog(), &[]);
        let err = plan(&built, &[PlanTarget::Key(key("zzz", "0001"))]).unwrap_err();
        match err {
            Error::UnresolvableTarget { app, name } => {
                assert_eq!(app, "zzz");
                assert_eq!(name, "0001");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_apply_and_unapply_targets_for_pending_units() {
        let pending = unit("blog", "0001_project")
            .with_replaces(("blog", "0001_initial"))
            .with_dependency(("cookbook", "0002"));
        let catalog = UnitCatalog::from_app_units([
            unit("cookbook", "0001"),
            unit("cookbook", "0002").with_dependency(("cookbook", "0001")),
            unit("blog", "0001_initial"),
        ])
        .with_pending_unit(pending);

        let config = BuildConfig {
            mode: SourceMode::PendingOverride,
            ..BuildConfig::default()
        };
        let built = GraphBuilder::new(config)
            .build(catalog, &BTreeSet::new())
            .unwrap();

        assert_eq!(
            apply_targets(&built),
            vec![PlanTarget::Key(key("blog", "0001_project"))]
        );
        // The pending unit has no same-app dependency, so unapplying it
        // means unapplying the whole app.
        assert_eq!(
            unapply_targets(&built),
            vec![PlanTarget::App("blog".to_string())]
        );
    }

    #[test]
    fn test_record_step_tracks_replaced_keys() {
        let catalog = UnitCatalog::from_app_units([
            unit("blog", "0001_initial"),
            unit("blog", "0002_tag").with_dependency(("blog", "0001_initial")),
        ])
        .with_pending_unit(
            unit("blog", "0001_project")
                .with_replaces(("blog", "0001_initial"))
                .with_replaces(("blog", "0002_tag")),
        );
        let config = BuildConfig {
            mode: SourceMode::PendingOverride,
            ..BuildConfig::default()
        };
        let built = GraphBuilder::new(config)
            .build(catalog, &BTreeSet::new())
            .unwrap();

        let steps = plan(&built, &[PlanTarget::Key(key("blog", "0001_project"))]).unwrap();
        let mut recorder = MemoryRecorder::new();
        for step in &steps {
            record_step(&mut recorder, &built, step).unwrap();
        }

        // The replaced originals are recorded alongside the squash, so a
        // later rebuild sees the whole range applied.
        let applied = recorder.applied().unwrap();
        assert!(applied.contains(&key("blog", "0001_project")));
        assert!(applied.contains(&key("blog", "0001_initial")));
        assert!(applied.contains(&key("blog", "0002_tag")));
    }

    #[test]
    fn test_unapply_targets_come_from_oldest_pending_unit() {
        let catalog = UnitCatalog::from_app_units([
            unit("blog", "0001_initial"),
            unit("blog", "0002_tag").with_dependency(("blog", "0001_initial")),
        ])
        .with_pending_unit(
            unit("blog", "0001_project").with_replaces(("blog", "0001_initial")),
        )
        .with_pending_unit(
            unit("blog", "0002_project")
                .with_replaces(("blog", "0002_tag"))
                .with_dependency(("blog", "0001_project")),
        );

        let config = BuildConfig {
            mode: SourceMode::PendingOverride,
            ..BuildConfig::default()
        };
        let built = GraphBuilder::new(config)
            .build(catalog, &BTreeSet::new())
            .unwrap();

        // 0002_project's dependency on 0001_project is internal to the
        // pending set; only the oldest unit decides the rollback point.
        assert_eq!(
            unapply_targets(&built),
            vec![PlanTarget::App("blog".to_string())]
        );
    }
}
