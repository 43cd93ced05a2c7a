//! Engine error types.

use crate::key::MigrationKey;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by graph construction, planning, and collection.
///
/// All variants abort the invocation at the point of detection; the graph is
/// deterministic from its inputs, so nothing is retried.
#[derive(Debug, Error)]
pub enum Error {
    /// Two or more leaf migrations exist for one app with no declared order.
    #[error("conflicting migrations detected ({details}); merge the conflicting leaf migrations to fix them")]
    Conflict {
        /// Per-app summary of the conflicting leaf names.
        details: String,
    },

    /// An edge references a node absent from the graph.
    #[error("migration {origin} depends on nonexistent node {missing}")]
    MissingDependency {
        /// The migration declaring the dependency.
        origin: MigrationKey,
        /// The key that could not be found.
        missing: MigrationKey,
    },

    /// An edge references a node that a squash could have covered, but the
    /// squash was blocked by partial application of its replaced range.
    #[error(
        "migration {origin} depends on nonexistent node {missing}; tried to replace {missing} \
         with any of [{candidates}] but some of the replaced migrations are already applied"
    )]
    PartiallyReplacedDependency {
        /// The migration declaring the dependency.
        origin: MigrationKey,
        /// The key that could not be found.
        missing: MigrationKey,
        /// Candidate squash migrations that claim to replace the key.
        candidates: String,
    },

    /// A cycle was found while walking the graph.
    #[error("circular dependency detected at {node}")]
    CircularDependency {
        /// A node on the cycle.
        node: MigrationKey,
    },

    /// A consolidated migration ended up depending on itself.
    #[error("consolidated migration {node} would depend on itself")]
    SelfDependency {
        /// The consolidated migration.
        node: MigrationKey,
    },

    /// A plan target names an app/key combination absent from the graph.
    #[error("cannot resolve migration target {app}.{name}")]
    UnresolvableTarget {
        /// The requested app label.
        app: String,
        /// The requested migration name.
        name: String,
    },

    /// A dependency names an app that has no migrations.
    #[error("dependency on app with no migrations: {app}")]
    NoMigrations {
        /// The app label.
        app: String,
    },

    /// A migration directory that was required does not exist.
    #[error("no such migration directory: {}", path.display())]
    MissingDirectory {
        /// The directory that was expected.
        path: PathBuf,
    },

    /// A unit or recorder file could not be deserialized.
    #[error("invalid migration file {}: {source}", path.display())]
    InvalidUnit {
        /// The offending file.
        path: PathBuf,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// Filesystem error while reading or writing migration files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure while writing collected units.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
