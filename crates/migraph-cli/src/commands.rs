//! Subcommand implementations.

use crate::{Args, Command};
use comfy_table::{Cell, Table};
use migraph_core::{
    apply_targets, load_app_units, load_flat_units, plan, record_step, unapply_targets,
    write_collected, BuildConfig, BuiltGraph, Collector, GraphBuilder, JsonRecorder,
    MigrationKey, MigrationRecorder, Operation, PlanStep, PlanTarget, SourceMode, UnitCatalog,
};
use std::collections::BTreeSet;
use std::error::Error;
use tracing::info;

pub fn run(args: Args) -> Result<(), Box<dyn Error>> {
    match args.command {
        Command::Collect { no_optimize } => collect(&args, no_optimize),
        Command::Plan { ref targets } => show_plan(&args, targets),
        Command::Apply { unapply } => apply(&args, unapply),
        Command::Status => status(&args),
    }
}

fn collect(args: &Args, no_optimize: bool) -> Result<(), Box<dyn Error>> {
    let built = build_apps(args)?;
    let mut collector = Collector::new();
    if no_optimize {
        collector = collector.without_optimization();
    }
    let collected = collector.collect(&built)?;

    if collected.is_empty() {
        println!("No unapplied migrations to collect.");
        return Ok(());
    }

    let paths = write_collected(&args.pending_dir, &collected)?;
    info!(files = paths.len(), dir = %args.pending_dir.display(), "collected");

    let mut table = Table::new();
    table.set_header(vec!["app", "migration", "replaces", "operations"]);
    for (app, units) in &collected {
        for unit in units {
            table.add_row(vec![
                Cell::new(app),
                Cell::new(&unit.key.name),
                Cell::new(unit.replaces.len()),
                Cell::new(unit.operations.len()),
            ]);
        }
    }
    println!("{table}");
    Ok(())
}

fn show_plan(args: &Args, raw_targets: &[String]) -> Result<(), Box<dyn Error>> {
    let built = build_apps(args)?;
    let targets = if raw_targets.is_empty() {
        built
            .graph
            .leaf_nodes(None)
            .into_iter()
            .map(PlanTarget::Key)
            .collect()
    } else {
        raw_targets
            .iter()
            .map(|raw| parse_target(raw, &built))
            .collect::<Result<Vec<_>, _>>()?
    };

    let steps = plan(&built, &targets)?;
    if steps.is_empty() {
        println!("Nothing to do.");
        return Ok(());
    }
    print_steps(&built, &steps);
    Ok(())
}

fn apply(args: &Args, unapply: bool) -> Result<(), Box<dyn Error>> {
    let built = build_pending(args)?;
    let targets = if unapply {
        unapply_targets(&built)
    } else {
        apply_targets(&built)
    };
    let steps = plan(&built, &targets)?;
    if steps.is_empty() {
        println!("Nothing to do.");
        return Ok(());
    }

    let mut recorder = JsonRecorder::new(&args.state);
    for step in &steps {
        // Executing the schema change itself belongs to an external
        // executor; here the outcome is recorded directly.
        info!(migration = %step.key, direction = %step.direction, "recording");
        record_step(&mut recorder, &built, step)?;
    }
    print_steps(&built, &steps);
    println!("Recorded {} step(s) in {}.", steps.len(), args.state.display());
    Ok(())
}

fn status(args: &Args) -> Result<(), Box<dyn Error>> {
    let built = build_apps(args)?;

    let mut table = Table::new();
    table.set_header(vec!["app", "migration", "applied"]);
    for key in built.graph.keys() {
        table.add_row(vec![
            Cell::new(&key.app),
            Cell::new(&key.name),
            Cell::new(if built.is_applied(key) { "yes" } else { "no" }),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn print_steps(built: &BuiltGraph, steps: &[PlanStep]) {
    let mut table = Table::new();
    table.set_header(vec!["#", "direction", "migration", "operations"]);
    for (idx, step) in steps.iter().enumerate() {
        let summary = built
            .graph
            .unit(&step.key)
            .map(|unit| {
                unit.operations
                    .iter()
                    .map(Operation::description)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(idx + 1),
            Cell::new(step.direction),
            Cell::new(&step.key),
            Cell::new(summary),
        ]);
    }
    println!("{table}");
}

fn app_catalog(args: &Args) -> Result<UnitCatalog, Box<dyn Error>> {
    let units = load_app_units(&args.apps_dir, false)?;
    Ok(UnitCatalog::from_app_units(units.into_values()))
}

fn build_apps(args: &Args) -> Result<BuiltGraph, Box<dyn Error>> {
    let catalog = app_catalog(args)?;
    let config = BuildConfig {
        mode: SourceMode::AppsOnly,
        project_apps: args.project_apps.clone(),
        tolerate_missing: true,
    };
    let applied = JsonRecorder::new(&args.state).applied()?;
    Ok(GraphBuilder::new(config).build(catalog, &applied)?)
}

fn build_pending(args: &Args) -> Result<BuiltGraph, Box<dyn Error>> {
    let mut catalog = app_catalog(args)?;
    let mut known: BTreeSet<String> =
        catalog.app_units.keys().map(|key| key.app.clone()).collect();
    known.extend(args.project_apps.iter().cloned());

    for unit in load_flat_units(&args.pending_dir, &known, false)?.into_values() {
        catalog = catalog.with_pending_unit(unit);
    }
    let config = BuildConfig {
        mode: SourceMode::PendingOverride,
        project_apps: args.project_apps.clone(),
        tolerate_missing: true,
    };
    let applied = JsonRecorder::new(&args.state).applied()?;
    Ok(GraphBuilder::new(config).build(catalog, &applied)?)
}

/// Parse a plan target: `app.name`, `app.zero` (roll the app back fully),
/// or a bare app label meaning the app's current leaf.
fn parse_target(raw: &str, built: &BuiltGraph) -> Result<PlanTarget, Box<dyn Error>> {
    match raw.split_once('.') {
        Some((app, "zero")) => Ok(PlanTarget::App(app.to_string())),
        Some((app, name)) => Ok(PlanTarget::Key(MigrationKey::new(app, name))),
        None => {
            let leaf = built
                .graph
                .leaf_nodes(Some(raw))
                .into_iter()
                .next()
                .ok_or_else(|| format!("no migrations found for app '{raw}'"))?;
            Ok(PlanTarget::Key(leaf))
        }
    }
}
