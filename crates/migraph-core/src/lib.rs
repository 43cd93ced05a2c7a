//! Migraph Core - Migration graph engine.
//!
//! This crate builds a dependency graph from on-disk migration units and the
//! recorded applied state, computes apply/unapply execution plans, and
//! collects unapplied ranges into consolidated project-level units.

pub mod build;
pub mod collect;
pub mod error;
pub mod graph;
pub mod key;
pub mod ops;
pub mod optimize;
pub mod plan;
pub mod recorder;
pub mod registry;
pub mod unit;
pub mod writer;

pub use build::{BuildConfig, BuiltGraph, GraphBuilder, SourceMode, UnitCatalog};
pub use error::Error;
pub use graph::MigrationGraph;
pub use key::MigrationKey;
pub use ops::{ColumnDef, ColumnKind, Operation};
pub use unit::{MigrationUnit, UnitDef};

// Planning exports
pub use plan::{apply_targets, plan, record_step, unapply_targets, Direction, PlanStep, PlanTarget};

// Collection exports
pub use collect::{CollectedUnits, Collector};
pub use optimize::OperationOptimizer;

// Disk and state exports
pub use recorder::{JsonRecorder, MemoryRecorder, MigrationRecorder};
pub use registry::{load_app_units, load_flat_units};
pub use writer::write_collected;
