use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::database_ops::db::Db;
use crate::database_ops::error::{Error, Result};
use crate::database_ops::identifier::Identifier;
use crate::database_ops::resolver::Resolve;
use crate::database_ops::sql::upsert_sql;
use crate::database_ops::value::{Cell, SqlValue};

pub const DEFAULT_LIMIT: usize = 2000;
/// SQLite's bound parameter ceiling per statement.
pub const MAX_BOUND_PARAMETERS: usize = 32_766;

/// Builds a row buffer from mixed literals and identifiers: `row!["sku", id, 3]`.
#[macro_export]
macro_rules! row {
    ($($cell:expr),* $(,)?) => {
        vec![$($crate::database_ops::value::Cell::from($cell)),*]
    };
}

/// Immutable configuration of a batched upsert.
///
/// ```ignore
/// let mut batch = Upsert::new("product", ["sku", "name"])
///     .on_duplicate(["name"])
///     .with_resolver(skus.clone())
///     .with_limit(500)
///     .build()?;
/// ```
pub struct Upsert {
    table: String,
    columns: Vec<String>,
    on_duplicate: Vec<String>,
    resolvers: Vec<Rc<dyn Resolve>>,
    null_on_unresolved: bool,
    formatted: IndexMap<String, String>,
    limit: usize,
}

impl Upsert {
    pub fn new(
        table: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            on_duplicate: Vec::new(),
            resolvers: Vec::new(),
            null_on_unresolved: false,
            formatted: IndexMap::new(),
            limit: DEFAULT_LIMIT,
        }
    }

    /// Columns overwritten with the incoming value when the row already exists.
    pub fn on_duplicate(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.on_duplicate = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Registers a resolver; identifiers are offered to resolvers in registration order.
    pub fn with_resolver(mut self, resolver: Rc<dyn Resolve>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Writes NULL for unresolvable fields instead of dropping the row.
    pub fn with_null_on_unresolved(mut self) -> Self {
        self.null_on_unresolved = true;
        self
    }

    /// Formats non-NULL values of `column`; `{}` marks where the value goes.
    pub fn with_formatted(
        mut self,
        column: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        self.formatted.insert(column.into(), template.into());
        self
    }

    /// Rows per statement.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn build(self) -> Result<BatchUpsert> {
        let plan = self.into_plan()?;
        debug!(
            target: "upsert",
            table = %plan.table,
            columns = plan.columns.len(),
            resolvers = plan.resolvers.len(),
            limit = plan.limit,
            "batch upsert ready"
        );
        Ok(BatchUpsert::new(plan))
    }

    fn into_plan(self) -> Result<UpsertPlan> {
        if self.table.trim().is_empty() {
            return Err(Error::config("table name is empty"));
        }
        if self.columns.is_empty() {
            return Err(Error::config(format!("no columns declared for {}", self.table)));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.as_str()) {
                return Err(Error::config(format!(
                    "column {column} declared twice for {}",
                    self.table
                )));
            }
        }
        if let Some(column) = self.on_duplicate.iter().find(|c| !seen.contains(c.as_str())) {
            return Err(Error::config(format!(
                "on_duplicate column {column} is not inserted into {}",
                self.table
            )));
        }

        let mut formatted = vec![None; self.columns.len()];
        for (column, template) in self.formatted {
            let Some(idx) = self.columns.iter().position(|c| c == &column) else {
                return Err(Error::config(format!(
                    "formatted column {column} is not inserted into {}",
                    self.table
                )));
            };
            if !template.contains("{}") {
                return Err(Error::config(format!("format for {column} has no {{}} placeholder")));
            }
            formatted[idx] = Some(template);
        }

        if self.limit == 0 {
            return Err(Error::config("limit must be at least one row"));
        }
        if self.limit * self.columns.len() > MAX_BOUND_PARAMETERS {
            return Err(Error::config(format!(
                "limit {} with {} columns exceeds {MAX_BOUND_PARAMETERS} bound parameters",
                self.limit,
                self.columns.len()
            )));
        }

        Ok(UpsertPlan {
            table: self.table,
            columns: self.columns,
            on_duplicate: self.on_duplicate,
            resolvers: self.resolvers,
            null_on_unresolved: self.null_on_unresolved,
            formatted,
            limit: self.limit,
        })
    }
}

/// Validated configuration; fixed for the lifetime of a [`BatchUpsert`].
pub struct UpsertPlan {
    table: String,
    columns: Vec<String>,
    on_duplicate: Vec<String>,
    resolvers: Vec<Rc<dyn Resolve>>,
    null_on_unresolved: bool,
    formatted: Vec<Option<String>>,
    limit: usize,
}

impl UpsertPlan {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn on_duplicate(&self) -> &[String] {
        &self.on_duplicate
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn null_on_unresolved(&self) -> bool {
        self.null_on_unresolved
    }

    fn owner_of(&self, identifier: &Identifier) -> Option<&Rc<dyn Resolve>> {
        let owner = identifier.owner()?;
        self.resolvers.iter().find(|r| r.id() == owner)
    }

    /// First registered resolver that answers wins; only the owner can answer for a placeholder.
    fn resolve(&self, identifier: &Identifier) -> Result<Option<i64>> {
        if let Identifier::Resolved(value) = identifier {
            return Ok(Some(*value));
        }
        for resolver in &self.resolvers {
            if Some(resolver.id()) != identifier.owner() {
                continue;
            }
            match resolver.resolve(identifier) {
                Ok(value) => return Ok(Some(value)),
                Err(err) if err.is_not_resolved() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn release(&self, identifier: Identifier) {
        if let Some(resolver) = self.owner_of(&identifier) {
            resolver.release(identifier);
        }
    }

    fn format(&self, idx: usize, value: SqlValue) -> SqlValue {
        match &self.formatted[idx] {
            Some(template) if !value.is_null() => {
                SqlValue::Text(template.replacen("{}", &value.to_string(), 1))
            }
            _ => value,
        }
    }
}

impl fmt::Debug for UpsertPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpsertPlan")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("on_duplicate", &self.on_duplicate)
            .field("resolvers", &self.resolvers.iter().map(|r| r.id()).collect::<Vec<_>>())
            .field("null_on_unresolved", &self.null_on_unresolved)
            .field("formatted", &self.formatted)
            .field("limit", &self.limit)
            .finish()
    }
}

/// Counters kept by a [`BatchUpsert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub statements: usize,
    /// Rows sent to the store, including conflicting rows left unchanged.
    pub rows_written: usize,
    pub rows_dropped: usize,
    pub fields_nulled: usize,
}

impl BatchStats {
    pub fn merge(&mut self, other: BatchStats) {
        self.statements += other.statements;
        self.rows_written += other.rows_written;
        self.rows_dropped += other.rows_dropped;
        self.fields_nulled += other.fields_nulled;
    }
}

struct ReadyRow {
    values: Vec<SqlValue>,
    // Placeholders the row consumed; handed back once the row is written.
    consumed: Vec<Identifier>,
}

enum RowOutcome {
    Ready { values: Vec<SqlValue>, nulled: usize },
    Dropped,
}

/// Row accumulator for one [`UpsertPlan`].
///
/// Rows wait in `pending` until a flush resolves them into `ready`; `ready` always holds rows
/// older than anything in `pending`, so rows reach the store in append order.
pub struct BatchUpsert {
    plan: UpsertPlan,
    pending: VecDeque<Vec<Cell>>,
    ready: VecDeque<ReadyRow>,
    statements: HashMap<usize, String>,
    stats: BatchStats,
}

impl BatchUpsert {
    fn new(plan: UpsertPlan) -> Self {
        Self {
            plan,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            statements: HashMap::new(),
            stats: BatchStats::default(),
        }
    }

    pub fn plan(&self) -> &UpsertPlan {
        &self.plan
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    /// Rows appended but not written yet.
    pub fn buffered(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    /// Appends a row in column order.
    ///
    /// # Panics
    ///
    /// When the row does not have exactly one cell per declared column.
    pub fn with_row(&mut self, row: impl IntoIterator<Item = Cell>) -> &mut Self {
        let row: Vec<Cell> = row.into_iter().collect();
        assert_eq!(
            row.len(),
            self.plan.columns.len(),
            "row arity does not match the columns of {}",
            self.plan.table
        );
        self.pending.push_back(row);
        self
    }

    /// Appends a row taken from a record; columns the record lacks become NULL and keys that are
    /// not columns are ignored.
    pub fn with_record(&mut self, mut record: IndexMap<String, Cell>) -> &mut Self {
        let row: Vec<Cell> = self
            .plan
            .columns
            .iter()
            .map(|column| record.shift_remove(column).unwrap_or_else(Cell::null))
            .collect();
        for (_, cell) in record {
            if let Cell::Id(identifier) = cell {
                self.plan.release(identifier);
            }
        }
        self.pending.push_back(row);
        self
    }

    /// Writes full chunks once more than `limit` rows are buffered; fewer than `limit` resolved
    /// rows stay behind for the next call.
    pub fn flush_if_over_limit(&mut self, db: &Db) -> Result<()> {
        if self.buffered() <= self.plan.limit {
            return Ok(());
        }
        self.resolve_buffered()?;
        while self.ready.len() >= self.plan.limit {
            self.execute_chunk(db, self.plan.limit)?;
        }
        Ok(())
    }

    /// Writes everything buffered: full chunks of `limit`, then the remainder.
    pub fn execute_if_not_empty(&mut self, db: &Db) -> Result<()> {
        self.resolve_buffered()?;
        while self.ready.len() >= self.plan.limit {
            self.execute_chunk(db, self.plan.limit)?;
        }
        if !self.ready.is_empty() {
            self.execute_chunk(db, self.ready.len())?;
        }
        Ok(())
    }

    fn resolve_row(&self, row: &[Cell]) -> Result<RowOutcome> {
        let mut values = Vec::with_capacity(row.len());
        let mut nulled = 0;

        for (idx, cell) in row.iter().enumerate() {
            let value = match cell {
                Cell::Value(value) => value.clone(),
                Cell::Id(identifier) => match self.plan.resolve(identifier)? {
                    Some(id) => SqlValue::Integer(id),
                    None if self.plan.null_on_unresolved => {
                        nulled += 1;
                        SqlValue::Null
                    }
                    None => return Ok(RowOutcome::Dropped),
                },
            };
            values.push(self.plan.format(idx, value));
        }

        Ok(RowOutcome::Ready { values, nulled })
    }

    fn resolve_buffered(&mut self) -> Result<()> {
        let mut resolved = 0;
        let mut dropped = 0;

        while let Some(row) = self.pending.front() {
            let outcome = self.resolve_row(row)?;
            let Some(row) = self.pending.pop_front() else {
                break;
            };
            let consumed = row.into_iter().filter_map(|cell| match cell {
                Cell::Id(identifier @ Identifier::Unresolved(_)) => Some(identifier),
                _ => None,
            });

            match outcome {
                RowOutcome::Ready { values, nulled } => {
                    self.stats.fields_nulled += nulled;
                    self.ready.push_back(ReadyRow {
                        values,
                        consumed: consumed.collect(),
                    });
                    resolved += 1;
                }
                RowOutcome::Dropped => {
                    for identifier in consumed {
                        self.plan.release(identifier);
                    }
                    self.stats.rows_dropped += 1;
                    dropped += 1;
                }
            }
        }

        if resolved + dropped > 0 {
            debug!(
                target: "upsert",
                table = %self.plan.table,
                resolved,
                dropped,
                "resolved buffered rows"
            );
        }
        Ok(())
    }

    fn statement(&mut self, rows: usize) -> &str {
        let plan = &self.plan;
        self.statements
            .entry(rows)
            .or_insert_with(|| upsert_sql(&plan.table, &plan.columns, &plan.on_duplicate, rows))
    }

    fn execute_chunk(&mut self, db: &Db, rows: usize) -> Result<()> {
        let params: Vec<SqlValue> = self
            .ready
            .iter()
            .take(rows)
            .flat_map(|row| row.values.iter().cloned())
            .collect();
        let sql = self.statement(rows).to_string();

        db.without_foreign_key_checks(|db| db.execute(&sql, &params))?;

        for row in self.ready.drain(..rows).collect::<Vec<_>>() {
            for identifier in row.consumed {
                self.plan.release(identifier);
            }
        }
        self.stats.statements += 1;
        self.stats.rows_written += rows;
        debug!(target: "upsert", table = %self.plan.table, rows, "executed chunk");
        Ok(())
    }
}

impl Drop for BatchUpsert {
    fn drop(&mut self) {
        let unwritten = self.buffered();
        if unwritten > 0 {
            warn!(
                target: "upsert",
                table = %self.plan.table,
                rows = unwritten,
                "discarding unwritten rows"
            );
        }
        for row in self.pending.drain(..) {
            for cell in row {
                if let Cell::Id(identifier) = cell {
                    self.plan.release(identifier);
                }
            }
        }
        for row in self.ready.drain(..) {
            for identifier in row.consumed {
                self.plan.release(identifier);
            }
        }
    }
}
