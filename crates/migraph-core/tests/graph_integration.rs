//! Integration tests for the full collect/apply/unapply cycle on disk.

use migraph_core::{
    apply_targets, load_app_units, load_flat_units, plan, record_step, unapply_targets,
    write_collected, BuildConfig, BuiltGraph, Collector, GraphBuilder, JsonRecorder,
    MigrationKey, MigrationRecorder, PlanTarget, SourceMode, UnitCatalog,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

struct TestContext {
    apps_dir: PathBuf,
    pending_dir: PathBuf,
    recorder: JsonRecorder,
    _dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Self {
            apps_dir: dir.path().join("migrations"),
            pending_dir: dir.path().join("pending_migrations"),
            recorder: JsonRecorder::new(dir.path().join("applied.json")),
            _dir: dir,
        };
        fs::create_dir_all(&ctx.apps_dir).unwrap();
        ctx
    }

    fn write_unit(&self, app: &str, name: &str, body: &str) {
        let dir = self.apps_dir.join(app);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{name}.json")), body).unwrap();
    }

    fn app_catalog(&self) -> UnitCatalog {
        let units = load_app_units(&self.apps_dir, false).unwrap();
        UnitCatalog::from_app_units(units.into_values())
    }

    fn build(&self) -> BuiltGraph {
        let applied = self.recorder.applied().unwrap();
        GraphBuilder::default()
            .build(self.app_catalog(), &applied)
            .unwrap()
    }

    fn build_pending(&self) -> BuiltGraph {
        let mut catalog = self.app_catalog();
        let known: BTreeSet<String> = catalog.app_units.keys().map(|k| k.app.clone()).collect();
        for unit in load_flat_units(&self.pending_dir, &known, false)
            .unwrap()
            .into_values()
        {
            catalog = catalog.with_pending_unit(unit);
        }
        let config = BuildConfig {
            mode: SourceMode::PendingOverride,
            ..BuildConfig::default()
        };
        GraphBuilder::new(config)
            .build(catalog, &self.recorder.applied().unwrap())
            .unwrap()
    }

    /// Stand-in for the external executor: record each step's outcome.
    fn run_plan(&mut self, built: &BuiltGraph, targets: &[PlanTarget]) -> Vec<MigrationKey> {
        let mut touched = Vec::new();
        for step in plan(built, targets).unwrap() {
            record_step(&mut self.recorder, built, &step).unwrap();
            touched.push(step.key);
        }
        touched
    }
}

fn key(app: &str, name: &str) -> MigrationKey {
    MigrationKey::new(app, name)
}

fn setup_blog_project(ctx: &TestContext) {
    ctx.write_unit(
        "cookbook",
        "0001_initial",
        r#"{
            "initial": true,
            "operations": [{
                "op": "create_table",
                "table": "recipe",
                "columns": [{"name": "id", "kind": "integer"}]
            }]
        }"#,
    );
    ctx.write_unit(
        "cookbook",
        "0002_recipe_title",
        r#"{
            "dependencies": [["cookbook", "0001_initial"]],
            "operations": [{
                "op": "add_column",
                "table": "recipe",
                "column": {"name": "title", "kind": "text"}
            }]
        }"#,
    );
    ctx.write_unit(
        "blog",
        "0001_initial",
        r#"{
            "initial": true,
            "dependencies": [["cookbook", "0002_recipe_title"]],
            "operations": [{
                "op": "create_table",
                "table": "post",
                "columns": [{"name": "id", "kind": "integer"}]
            }]
        }"#,
    );
}

#[test]
fn test_plan_orders_cross_app_dependencies() {
    let mut ctx = TestContext::new();
    setup_blog_project(&ctx);

    let built = ctx.build();
    let targets: Vec<PlanTarget> = built
        .graph
        .leaf_nodes(None)
        .into_iter()
        .map(PlanTarget::Key)
        .collect();
    let touched = ctx.run_plan(&built, &targets);

    assert_eq!(
        touched,
        vec![
            key("cookbook", "0001_initial"),
            key("cookbook", "0002_recipe_title"),
            key("blog", "0001_initial"),
        ]
    );
}

#[test]
fn test_collect_write_apply_unapply_cycle() {
    let mut ctx = TestContext::new();
    setup_blog_project(&ctx);

    // Collect the unapplied ranges and write them out. blog branches off
    // cookbook's 0002, so cookbook splits into two consolidated units.
    let built = ctx.build();
    let collected = Collector::new().collect(&built).unwrap();
    let paths = write_collected(&ctx.pending_dir, &collected).unwrap();
    assert_eq!(paths.len(), 3);

    // The pending graph substitutes the collected units for the originals.
    let pending = ctx.build_pending();
    assert!(pending.graph.contains(&key("blog", "0001_project")));
    assert!(pending.graph.contains(&key("cookbook", "0001_project")));
    assert!(pending.graph.contains(&key("cookbook", "0002_project")));
    assert!(!pending.graph.contains(&key("blog", "0001_initial")));

    // Apply: cookbook's consolidated units must come first.
    let applied_keys = {
        let targets = apply_targets(&pending);
        ctx.run_plan(&pending, &targets)
    };
    assert_eq!(
        applied_keys,
        vec![
            key("cookbook", "0001_project"),
            key("cookbook", "0002_project"),
            key("blog", "0001_project"),
        ]
    );
    let recorded = ctx.recorder.applied().unwrap();
    assert!(recorded.contains(&key("cookbook", "0001_project")));
    assert!(recorded.contains(&key("blog", "0001_project")));
    // Replaced originals are recorded too, so a rebuild absorbs the squash.
    assert!(recorded.contains(&key("cookbook", "0001_initial")));

    // Unapply rolls everything back, dependents first.
    let pending = ctx.build_pending();
    let unapplied_keys = {
        let targets = unapply_targets(&pending);
        ctx.run_plan(&pending, &targets)
    };
    assert_eq!(
        unapplied_keys,
        vec![
            key("blog", "0001_project"),
            key("cookbook", "0002_project"),
            key("cookbook", "0001_project"),
        ]
    );
    assert!(ctx.recorder.applied().unwrap().is_empty());
}

#[test]
fn test_squash_on_disk_is_absorbed_when_range_applied() {
    let mut ctx = TestContext::new();
    setup_blog_project(&ctx);

    // Apply everything at unit granularity first.
    let built = ctx.build();
    let targets: Vec<PlanTarget> = built
        .graph
        .leaf_nodes(None)
        .into_iter()
        .map(PlanTarget::Key)
        .collect();
    ctx.run_plan(&built, &targets);

    // A squash later lands on disk covering cookbook's whole range.
    ctx.write_unit(
        "cookbook",
        "0001_squashed",
        r#"{
            "replaces": [
                ["cookbook", "0001_initial"],
                ["cookbook", "0002_recipe_title"]
            ],
            "operations": [{
                "op": "create_table",
                "table": "recipe",
                "columns": [
                    {"name": "id", "kind": "integer"},
                    {"name": "title", "kind": "text"}
                ]
            }]
        }"#,
    );

    let built = ctx.build();
    assert!(built.is_applied(&key("cookbook", "0001_squashed")));
    assert!(!built.graph.contains(&key("cookbook", "0001_initial")));
    assert!(!built.graph.contains(&key("cookbook", "0002_recipe_title")));

    // blog's dependency now points at the squash, so nothing needs doing.
    let steps = plan(&built, &[PlanTarget::Key(key("blog", "0001_initial"))]).unwrap();
    assert!(steps.is_empty());
}

#[test]
fn test_collect_skips_applied_prefix_on_disk() {
    let mut ctx = TestContext::new();
    setup_blog_project(&ctx);

    // Apply cookbook's first unit only.
    let built = ctx.build();
    ctx.run_plan(&built, &[PlanTarget::Key(key("cookbook", "0001_initial"))]);

    let built = ctx.build();
    let collected = Collector::new().collect(&built).unwrap();
    let cookbook = &collected["cookbook"][0];

    assert_eq!(cookbook.replaces, vec![key("cookbook", "0002_recipe_title")]);
    assert_eq!(cookbook.dependencies, vec![key("cookbook", "0001_initial")]);
}

#[test]
fn test_collected_output_replaces_previous_run() {
    let mut ctx = TestContext::new();
    setup_blog_project(&ctx);

    let built = ctx.build();
    let collected = Collector::new().collect(&built).unwrap();
    write_collected(&ctx.pending_dir, &collected).unwrap();

    // Applying cookbook's first unit shrinks the next collection; the old
    // pending files must not survive alongside the new ones.
    ctx.run_plan(&ctx.build(), &[PlanTarget::Key(key("cookbook", "0001_initial"))]);
    let built = ctx.build();
    let collected = Collector::new().collect(&built).unwrap();
    let paths = write_collected(&ctx.pending_dir, &collected).unwrap();

    let on_disk: Vec<String> = fs::read_dir(&ctx.pending_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(on_disk.len(), paths.len());
}
