use std::path::Path;

use anyhow::{bail, Context, Result};
use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use serde_json::Value;

use crate::database_ops::resolver::Filter;
use crate::database_ops::value::SqlValue;

/// Where a target column takes its value from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case", deny_unknown_fields)]
pub enum ColumnSource {
    /// Text of a record field; NULL when the record lacks it.
    Field { field: String },
    /// The same JSON scalar for every row.
    Constant { value: Value },
    /// Surrogate key of the record field's value, through a single-table resolver.
    Lookup { resolver: String, field: String },
    /// Surrogate key of `(field, foreign_field)`, through a combined resolver.
    CompositeLookup {
        resolver: String,
        field: String,
        foreign_field: String,
    },
}

impl ColumnSource {
    fn resolver(&self) -> Option<&str> {
        match self {
            ColumnSource::Lookup { resolver, .. }
            | ColumnSource::CompositeLookup { resolver, .. } => Some(resolver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ResolverSpec {
    Single {
        table: String,
        search: String,
        target: String,
        #[serde(default)]
        filter: IndexMap<String, Vec<Value>>,
        /// Enables speculative allocation with these values for the other columns.
        #[serde(default)]
        auto_increment: Option<IndexMap<String, Value>>,
    },
    Combined {
        table: String,
        search: String,
        target: String,
        foreign: String,
        foreign_resolver: String,
        #[serde(default = "allocate_by_default")]
        allocate: bool,
    },
}

fn allocate_by_default() -> bool {
    true
}

impl ResolverSpec {
    pub fn table(&self) -> &str {
        match self {
            ResolverSpec::Single { table, .. } | ResolverSpec::Combined { table, .. } => table,
        }
    }

    /// Every column of its table the resolver reads or writes.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            ResolverSpec::Single {
                search,
                target,
                filter,
                auto_increment,
                ..
            } => {
                let mut columns: IndexSet<&str> =
                    [search.as_str(), target.as_str()].into_iter().collect();
                columns.extend(filter.keys().map(String::as_str));
                if let Some(template) = auto_increment {
                    columns.extend(template.keys().map(String::as_str));
                }
                columns.into_iter().collect()
            }
            ResolverSpec::Combined {
                search, target, foreign, ..
            } => vec![target.as_str(), search.as_str(), foreign.as_str()],
        }
    }
}

/// One target table of a step: how each record becomes a row of it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableMapping {
    pub table: String,
    pub columns: IndexMap<String, ColumnSource>,
    #[serde(default)]
    pub on_duplicate: Vec<String>,
    #[serde(default)]
    pub null_on_unresolved: bool,
    #[serde(default)]
    pub formatted: IndexMap<String, String>,
}

/// One import step: the tables every record fills, in write order, and the named resolvers
/// they share.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportMapping {
    pub tables: Vec<TableMapping>,
    #[serde(default)]
    pub resolvers: IndexMap<String, ResolverSpec>,
    /// Rows per statement for every table; falls back to `IMPORT_FLUSH_LIMIT`.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Commit the whole step at once, or roll all of it back on error.
    #[serde(default)]
    pub transactional: bool,
}

impl ImportMapping {
    pub fn from_json(raw: &str) -> Result<Self> {
        let mapping: ImportMapping =
            serde_json::from_str(raw).context("parsing import mapping")?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading mapping {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid mapping {}", path.display()))
    }

    /// Target tables joined with `+`, for logs and summaries.
    pub fn label(&self) -> String {
        self.tables
            .iter()
            .map(|t| t.table.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Checks resolver references. Column level checks happen when the batch is built and
    /// against the schema in preflight.
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            bail!("mapping declares no tables");
        }

        for (position, (name, spec)) in self.resolvers.iter().enumerate() {
            match spec {
                ResolverSpec::Single {
                    filter,
                    auto_increment,
                    ..
                } => {
                    filter_of(filter).with_context(|| format!("resolver {name}"))?;
                    if let Some(template) = auto_increment {
                        template_of(template).with_context(|| format!("resolver {name}"))?;
                    }
                }
                ResolverSpec::Combined {
                    foreign_resolver, ..
                } => match self.resolvers.get_full(foreign_resolver) {
                    Some((idx, _, ResolverSpec::Single { .. })) if idx < position => {}
                    Some((_, _, ResolverSpec::Single { .. })) => bail!(
                        "resolver {name}: foreign resolver {foreign_resolver} must be declared \
                         before it"
                    ),
                    Some(_) => bail!(
                        "resolver {name}: foreign resolver {foreign_resolver} must be a single \
                         resolver"
                    ),
                    None => bail!("resolver {name}: unknown foreign resolver {foreign_resolver}"),
                },
            }
        }

        for target in &self.tables {
            self.validate_table(target)
                .with_context(|| format!("table {}", target.table))?;
        }
        Ok(())
    }

    fn validate_table(&self, target: &TableMapping) -> Result<()> {
        if target.columns.is_empty() {
            bail!("no columns declared");
        }

        for (column, source) in &target.columns {
            let Some(resolver) = source.resolver() else {
                if let ColumnSource::Constant { value } = source {
                    if SqlValue::from_json(value).is_none() {
                        bail!("column {column}: constant must be a scalar");
                    }
                }
                continue;
            };
            match (source, self.resolvers.get(resolver)) {
                (_, None) => bail!("column {column}: unknown resolver {resolver}"),
                (ColumnSource::Lookup { .. }, Some(ResolverSpec::Single { .. })) => {}
                (ColumnSource::CompositeLookup { .. }, Some(ResolverSpec::Combined { .. })) => {}
                (ColumnSource::Lookup { .. }, Some(_)) => bail!(
                    "column {column}: lookup needs a single resolver, {resolver} is combined"
                ),
                (_, Some(_)) => bail!(
                    "column {column}: composite_lookup needs a combined resolver, {resolver} is \
                     single"
                ),
            }
        }
        Ok(())
    }

    /// Tables and the columns of each that this step touches, target tables first.
    pub fn touched_columns(&self) -> IndexMap<&str, IndexSet<&str>> {
        let mut touched: IndexMap<&str, IndexSet<&str>> = IndexMap::new();
        for target in &self.tables {
            touched
                .entry(target.table.as_str())
                .or_default()
                .extend(target.columns.keys().map(String::as_str));
        }
        for spec in self.resolvers.values() {
            touched.entry(spec.table()).or_default().extend(spec.columns());
        }
        touched
    }
}

fn scalar(value: &Value) -> Result<SqlValue> {
    match SqlValue::from_json(value) {
        Some(value) => Ok(value),
        None => bail!("expected a scalar, got {value}"),
    }
}

/// Converts a JSON filter (`column -> [values]`).
pub fn filter_of(raw: &IndexMap<String, Vec<Value>>) -> Result<Filter> {
    raw.iter().try_fold(Filter::new(), |filter, (column, values)| -> Result<Filter> {
        let values = values.iter().map(scalar).collect::<Result<Vec<_>>>()?;
        Ok(filter.with(column.clone(), values))
    })
}

/// Converts a JSON allocation template (`column -> value`).
pub fn template_of(raw: &IndexMap<String, Value>) -> Result<IndexMap<String, SqlValue>> {
    raw.iter()
        .map(|(column, value)| -> Result<(String, SqlValue)> {
            Ok((column.clone(), scalar(value)?))
        })
        .collect()
}
