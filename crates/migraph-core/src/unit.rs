//! Migration unit data model.

use crate::key::MigrationKey;
use crate::ops::Operation;
use serde::{Deserialize, Serialize};

/// One app-scoped changeset: identity, relations, and an ordered list of
/// schema-change operations.
///
/// Two units are the same changeset iff their keys are equal; nothing ever
/// compares operations structurally to decide identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    /// Identity key; immutable once created.
    pub key: MigrationKey,
    /// Keys that must be applied before this unit.
    pub dependencies: Vec<MigrationKey>,
    /// Keys that must be applied after this unit (reversed at edge time).
    pub run_before: Vec<MigrationKey>,
    /// Keys this unit supersedes; empty for ordinary units.
    pub replaces: Vec<MigrationKey>,
    /// Ordered schema-change descriptors.
    pub operations: Vec<Operation>,
    /// Whether this is the app's initial migration.
    pub initial: bool,
}

impl MigrationUnit {
    /// Create an empty unit with the given identity.
    pub fn new(key: MigrationKey) -> Self {
        Self {
            key,
            dependencies: Vec::new(),
            run_before: Vec::new(),
            replaces: Vec::new(),
            operations: Vec::new(),
            initial: false,
        }
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, key: impl Into<MigrationKey>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    /// Add a run-before relation.
    pub fn with_run_before(mut self, key: impl Into<MigrationKey>) -> Self {
        self.run_before.push(key.into());
        self
    }

    /// Add a replaced key.
    pub fn with_replaces(mut self, key: impl Into<MigrationKey>) -> Self {
        self.replaces.push(key.into());
        self
    }

    /// Append an operation.
    pub fn with_operation(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    /// Mark as the app's initial migration.
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Whether this unit replaces others (a squash).
    pub fn is_replacement(&self) -> bool {
        !self.replaces.is_empty()
    }

    /// Dependencies targeting this unit's own app.
    pub fn same_app_dependencies(&self) -> impl Iterator<Item = &MigrationKey> {
        self.dependencies.iter().filter(|d| d.app == self.key.app)
    }
}

impl std::fmt::Display for MigrationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// On-disk body of a migration unit (everything except the identity, which
/// comes from the file location).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitDef {
    /// Keys that must be applied first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<MigrationKey>,
    /// Keys that must be applied after this unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_before: Vec<MigrationKey>,
    /// Keys this unit supersedes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<MigrationKey>,
    /// Ordered schema-change descriptors.
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// Whether this is the app's initial migration.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub initial: bool,
}

impl UnitDef {
    /// Attach an identity, producing a full unit.
    pub fn into_unit(self, key: MigrationKey) -> MigrationUnit {
        MigrationUnit {
            key,
            dependencies: self.dependencies,
            run_before: self.run_before,
            replaces: self.replaces,
            operations: self.operations,
            initial: self.initial,
        }
    }
}

impl From<&MigrationUnit> for UnitDef {
    fn from(unit: &MigrationUnit) -> Self {
        Self {
            dependencies: unit.dependencies.clone(),
            run_before: unit.run_before.clone(),
            replaces: unit.replaces.clone(),
            operations: unit.operations.clone(),
            initial: unit.initial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{ColumnDef, ColumnKind};

    #[test]
    fn test_unit_builder() {
        let unit = MigrationUnit::new(MigrationKey::new("blog", "0002_post"))
            .with_dependency(("blog", "0001_initial"))
            .with_operation(Operation::CreateTable {
                table: "post".into(),
                columns: vec![ColumnDef::new("id", ColumnKind::Uuid)],
            });

        assert_eq!(unit.dependencies.len(), 1);
        assert_eq!(unit.operations.len(), 1);
        assert!(!unit.is_replacement());
    }

    #[test]
    fn test_same_app_dependencies() {
        let unit = MigrationUnit::new(MigrationKey::new("blog", "0002_post"))
            .with_dependency(("blog", "0001_initial"))
            .with_dependency(("cookbook", "0001_initial"));

        let same: Vec<_> = unit.same_app_dependencies().collect();
        assert_eq!(same, vec![&MigrationKey::new("blog", "0001_initial")]);
    }

    #[test]
    fn test_unit_def_round_trip() {
        let unit = MigrationUnit::new(MigrationKey::new("cookbook", "0002_recipe"))
            .with_dependency(("cookbook", "0001_initial"))
            .with_replaces(("cookbook", "0001_initial"))
            .initial();

        let def = UnitDef::from(&unit);
        let json = serde_json::to_string(&def).unwrap();
        let back: UnitDef = serde_json::from_str(&json).unwrap();
        let rebuilt = back.into_unit(unit.key.clone());
        assert_eq!(rebuilt, unit);
    }

    #[test]
    fn test_unit_def_defaults() {
        let def: UnitDef = serde_json::from_str(r#"{"operations": []}"#).unwrap();
        assert!(def.dependencies.is_empty());
        assert!(!def.initial);
    }
}
