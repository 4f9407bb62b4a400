use std::fmt;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::database_ops::db::Db;
use crate::importer::mapping::ImportMapping;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaProblem {
    MissingTable(String),
    MissingColumn { table: String, column: String },
}

impl fmt::Display for SchemaProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaProblem::MissingTable(table) => write!(f, "table {table} does not exist"),
            SchemaProblem::MissingColumn { table, column } => {
                write!(f, "column {table}.{column} does not exist")
            }
        }
    }
}

/// Lists every table or column `mapping` touches that the schema lacks.
pub fn schema_problems(db: &Db, mapping: &ImportMapping) -> Result<Vec<SchemaProblem>> {
    let mut problems = Vec::new();
    for (table, columns) in mapping.touched_columns() {
        let existing = db.table_columns(table)?;
        if existing.is_empty() {
            problems.push(SchemaProblem::MissingTable(table.to_string()));
            continue;
        }
        for column in columns {
            if !existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                problems.push(SchemaProblem::MissingColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
        }
    }
    Ok(problems)
}

/// Fails when the schema cannot hold what `mapping` writes or looks up.
pub fn preflight(db: &Db, mapping: &ImportMapping) -> Result<()> {
    let problems = schema_problems(db, mapping)?;
    if problems.is_empty() {
        info!(target: "import", tables = %mapping.label(), "preflight ok");
        return Ok(());
    }
    for problem in &problems {
        warn!(target: "import", tables = %mapping.label(), %problem, "preflight");
    }
    bail!(
        "mapping for {} does not match the schema: {}",
        mapping.label(),
        problems
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    )
}
