//! Schema-change operation descriptors.
//!
//! Operations are opaque to the graph engine; only their count and table
//! references matter during collection and optimization. Execution against a
//! live schema belongs to the external executor.

use serde::{Deserialize, Serialize};

/// Column type for operation descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInt,
    /// Double-precision float.
    Real,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Blob,
    /// Boolean.
    Boolean,
    /// UUID.
    Uuid,
    /// Timestamp with timezone.
    Timestamp,
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnKind::Integer => write!(f, "integer"),
            ColumnKind::BigInt => write!(f, "bigint"),
            ColumnKind::Real => write!(f, "real"),
            ColumnKind::Text => write!(f, "text"),
            ColumnKind::Blob => write!(f, "blob"),
            ColumnKind::Boolean => write!(f, "boolean"),
            ColumnKind::Uuid => write!(f, "uuid"),
            ColumnKind::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// Definition of a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub kind: ColumnKind,
    /// Whether NULL values are allowed.
    #[serde(default)]
    pub nullable: bool,
    /// Default value expression, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ColumnDef {
    /// Create a non-nullable column with no default.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            default: None,
        }
    }

    /// Mark the column nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set a default value expression.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// A single atomic schema-change descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create a table with an initial column set.
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    /// Drop a table.
    DropTable { table: String },
    /// Rename a table.
    RenameTable { table: String, new_name: String },
    /// Add a column to an existing table.
    AddColumn { table: String, column: ColumnDef },
    /// Replace a column's definition.
    AlterColumn { table: String, column: ColumnDef },
    /// Drop a column.
    DropColumn { table: String, column: String },
    /// Raw SQL escape hatch; opaque to the optimizer.
    RunSql {
        forwards: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backwards: Option<String>,
    },
}

impl Operation {
    /// The table this operation targets, if statically known.
    pub fn table(&self) -> Option<&str> {
        match self {
            Operation::CreateTable { table, .. }
            | Operation::DropTable { table }
            | Operation::RenameTable { table, .. }
            | Operation::AddColumn { table, .. }
            | Operation::AlterColumn { table, .. }
            | Operation::DropColumn { table, .. } => Some(table),
            Operation::RunSql { .. } => None,
        }
    }

    /// Whether this operation may touch the named table.
    ///
    /// `RunSql` is opaque, so it conservatively references everything.
    pub fn references_table(&self, table: &str) -> bool {
        match self {
            Operation::RunSql { .. } => true,
            Operation::RenameTable {
                table: t, new_name, ..
            } => t == table || new_name == table,
            other => other.table() == Some(table),
        }
    }

    /// Short human-readable description.
    pub fn description(&self) -> String {
        match self {
            Operation::CreateTable { table, columns } => {
                format!("Create table '{}' ({} columns)", table, columns.len())
            }
            Operation::DropTable { table } => format!("Drop table '{}'", table),
            Operation::RenameTable { table, new_name } => {
                format!("Rename table '{}' to '{}'", table, new_name)
            }
            Operation::AddColumn { table, column } => {
                format!("Add column '{}.{}' ({})", table, column.name, column.kind)
            }
            Operation::AlterColumn { table, column } => {
                format!("Alter column '{}.{}' ({})", table, column.name, column.kind)
            }
            Operation::DropColumn { table, column } => {
                format!("Drop column '{}.{}'", table, column)
            }
            Operation::RunSql { .. } => "Run raw SQL".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_references() {
        let op = Operation::AddColumn {
            table: "recipe".into(),
            column: ColumnDef::new("title", ColumnKind::Text),
        };
        assert!(op.references_table("recipe"));
        assert!(!op.references_table("post"));
    }

    #[test]
    fn test_rename_references_both_names() {
        let op = Operation::RenameTable {
            table: "recipe".into(),
            new_name: "dish".into(),
        };
        assert!(op.references_table("recipe"));
        assert!(op.references_table("dish"));
    }

    #[test]
    fn test_run_sql_is_opaque() {
        let op = Operation::RunSql {
            forwards: "UPDATE recipe SET rating = 0".into(),
            backwards: None,
        };
        assert!(op.references_table("recipe"));
        assert!(op.references_table("anything"));
        assert_eq!(op.table(), None);
    }

    #[test]
    fn test_operation_serde_tagging() {
        let op = Operation::DropColumn {
            table: "post".into(),
            column: "draft".into(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "drop_column");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
