//! Operation list optimization.
//!
//! Merges or cancels redundant consecutive operations in a consolidated
//! unit (create-then-alter, add-then-drop, and similar). Purely a size
//! optimization: the net schema effect is never changed.

use crate::ops::{ColumnDef, Operation};

/// Pairwise operation reducer, run to a fixpoint.
#[derive(Debug, Default)]
pub struct OperationOptimizer;

impl OperationOptimizer {
    /// Create an optimizer.
    pub fn new() -> Self {
        Self
    }

    /// Optimize until no further reduction applies.
    pub fn optimize(&self, mut operations: Vec<Operation>) -> Vec<Operation> {
        loop {
            let (result, reduced) = Self::optimize_once(operations);
            operations = result;
            if !reduced {
                return operations;
            }
        }
    }

    /// One left-to-right pass; applies at most one reduction.
    fn optimize_once(ops: Vec<Operation>) -> (Vec<Operation>, bool) {
        for i in 0..ops.len() {
            let Some(table) = ops[i].table() else {
                // Raw SQL is opaque and blocks movement entirely.
                continue;
            };
            for j in (i + 1)..ops.len() {
                if let Some(replacement) = Self::reduce(&ops[i], &ops[j]) {
                    // Everything strictly between i and j is known not to
                    // touch the table (the scan below breaks otherwise), so
                    // the pair can be combined in place.
                    let mut out = Vec::with_capacity(ops.len());
                    out.extend_from_slice(&ops[..i]);
                    out.extend(replacement);
                    out.extend_from_slice(&ops[i + 1..j]);
                    out.extend_from_slice(&ops[j + 1..]);
                    return (out, true);
                }
                if ops[j].references_table(table) {
                    // An irreducible operation on the same table pins
                    // everything to its right.
                    break;
                }
            }
        }
        (ops, false)
    }

    /// Combine an earlier operation with a later one, if possible.
    ///
    /// An empty replacement means the pair cancels outright.
    fn reduce(earlier: &Operation, later: &Operation) -> Option<Vec<Operation>> {
        use Operation::*;

        match (earlier, later) {
            (CreateTable { table, .. }, DropTable { table: dropped }) if table == dropped => {
                Some(Vec::new())
            }
            (CreateTable { table, columns }, AddColumn { table: target, column })
                if table == target =>
            {
                let mut columns = columns.clone();
                columns.push(column.clone());
                Some(vec![CreateTable {
                    table: table.clone(),
                    columns,
                }])
            }
            (CreateTable { table, columns }, AlterColumn { table: target, column })
                if table == target && has_column(columns, &column.name) =>
            {
                let columns = columns
                    .iter()
                    .map(|c| {
                        if c.name == column.name {
                            column.clone()
                        } else {
                            c.clone()
                        }
                    })
                    .collect();
                Some(vec![CreateTable {
                    table: table.clone(),
                    columns,
                }])
            }
            (CreateTable { table, columns }, DropColumn { table: target, column })
                if table == target && has_column(columns, column) =>
            {
                let columns = columns.iter().filter(|c| &c.name != column).cloned().collect();
                Some(vec![CreateTable {
                    table: table.clone(),
                    columns,
                }])
            }
            (CreateTable { table, columns }, RenameTable { table: target, new_name })
                if table == target =>
            {
                Some(vec![CreateTable {
                    table: new_name.clone(),
                    columns: columns.clone(),
                }])
            }
            (AddColumn { table, column }, DropColumn { table: target, column: dropped })
                if table == target && &column.name == dropped =>
            {
                Some(Vec::new())
            }
            (AddColumn { table, column }, AlterColumn { table: target, column: altered })
                if table == target && column.name == altered.name =>
            {
                Some(vec![AddColumn {
                    table: table.clone(),
                    column: altered.clone(),
                }])
            }
            (AlterColumn { table, column }, AlterColumn { table: target, column: altered })
                if table == target && column.name == altered.name =>
            {
                Some(vec![AlterColumn {
                    table: table.clone(),
                    column: altered.clone(),
                }])
            }
            (RenameTable { table, new_name }, RenameTable { table: mid, new_name: final_name })
                if new_name == mid =>
            {
                Some(vec![RenameTable {
                    table: table.clone(),
                    new_name: final_name.clone(),
                }])
            }
            _ => None,
        }
    }
}

fn has_column(columns: &[ColumnDef], name: &str) -> bool {
    columns.iter().any(|c| c.name == name)
}
