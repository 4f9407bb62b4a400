use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{info, instrument};

use crate::database_ops::combined_table::CombinedTableResolver;
use crate::database_ops::db::Db;
use crate::database_ops::resolver::{IdResolver, ResolverFactory};
use crate::database_ops::single_table::SingleTableResolver;
use crate::database_ops::upsert::{BatchStats, BatchUpsert, Upsert};
use crate::database_ops::value::{Cell, SqlValue};
use crate::importer::mapping::{
    filter_of, template_of, ColumnSource, ImportMapping, ResolverSpec, TableMapping,
};
use crate::importer::progress::Progress;
use crate::importer::source::Record;
use crate::util::env as env_util;

#[derive(Debug, Clone)]
enum BuiltResolver {
    Single(Rc<SingleTableResolver>),
    Combined(Rc<CombinedTableResolver>),
}

/// Counters for one target table of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub table: String,
    #[serde(flatten)]
    pub stats: BatchStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub records: usize,
    pub tables: Vec<TableSummary>,
    pub elapsed_ms: u128,
}

impl ImportSummary {
    /// Counters summed over every table.
    pub fn total(&self) -> BatchStats {
        let mut total = BatchStats::default();
        for table in &self.tables {
            total.merge(table.stats);
        }
        total
    }
}

struct TableJob {
    mapping: TableMapping,
    batch: BatchUpsert,
}

/// One mapping bound to a connection: resolvers built, one batch per target table.
pub struct ImportJob {
    db: Rc<Db>,
    mapping: ImportMapping,
    resolvers: IndexMap<String, BuiltResolver>,
    tables: Vec<TableJob>,
}

impl ImportJob {
    /// Builds the step's resolvers in declaration order, then a batch per target table that
    /// knows all of them. `limit` overrides the mapping's own limit; with neither,
    /// `IMPORT_FLUSH_LIMIT` applies.
    pub fn prepare(db: Rc<Db>, mapping: ImportMapping, limit: Option<usize>) -> Result<Self> {
        mapping.validate()?;
        let factory = ResolverFactory::new(Rc::clone(&db));

        let mut resolvers: IndexMap<String, BuiltResolver> = IndexMap::new();
        for (name, spec) in &mapping.resolvers {
            let built = match spec {
                ResolverSpec::Single {
                    table,
                    search,
                    target,
                    filter,
                    auto_increment,
                } => {
                    let mut resolver = factory
                        .single(table, search, target)
                        .with_filter(filter_of(filter)?);
                    if let Some(template) = auto_increment {
                        resolver = resolver.with_auto_increment(template_of(template)?);
                    }
                    BuiltResolver::Single(Rc::new(resolver))
                }
                ResolverSpec::Combined {
                    table,
                    search,
                    target,
                    foreign,
                    foreign_resolver,
                    allocate,
                } => {
                    let Some(BuiltResolver::Single(foreign_resolver)) =
                        resolvers.get(foreign_resolver)
                    else {
                        return Err(anyhow!(
                            "resolver {name}: foreign resolver {foreign_resolver} is not available"
                        ));
                    };
                    let resolver =
                        factory.combined(table, target, search, foreign, foreign_resolver.clone());
                    let resolver = if *allocate { resolver } else { resolver.lookup_only() };
                    BuiltResolver::Combined(Rc::new(resolver))
                }
            };
            resolvers.insert(name.clone(), built);
        }

        let limit = limit.or(mapping.limit).unwrap_or_else(env_util::flush_limit);
        let tables = mapping
            .tables
            .iter()
            .map(|target| -> Result<TableJob> {
                Ok(TableJob {
                    mapping: target.clone(),
                    batch: build_batch(target, &resolvers, limit)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            db,
            mapping,
            resolvers,
            tables,
        })
    }

    pub fn mapping(&self) -> &ImportMapping {
        &self.mapping
    }

    fn resolver(&self, name: &str) -> Result<&BuiltResolver> {
        self.resolvers
            .get(name)
            .ok_or_else(|| anyhow!("unknown resolver {name}"))
    }

    /// Turns a record into a row of `target` in column order; lookups only queue their keys.
    fn project(&self, target: &TableMapping, record: &Record) -> Result<Vec<Cell>> {
        let field = |name: &str| {
            record
                .get(name)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
        };

        target
            .columns
            .iter()
            .map(|(column, source)| -> Result<Cell> {
                let cell = match source {
                    ColumnSource::Field { field: name } => Cell::from(record.get(name).cloned()),
                    ColumnSource::Constant { value } => {
                        let value = SqlValue::from_json(value)
                            .ok_or_else(|| anyhow!("column {column}: constant is not a scalar"))?;
                        Cell::from(value)
                    }
                    ColumnSource::Lookup {
                        resolver,
                        field: name,
                    } => match (self.resolver(resolver)?, field(name)) {
                        (BuiltResolver::Single(r), Some(key)) => {
                            Cell::from(r.unresolved(key.to_string()))
                        }
                        (_, None) => Cell::null(),
                        (BuiltResolver::Combined(_), _) => {
                            return Err(anyhow!(
                                "column {column}: {resolver} is not a single resolver"
                            ))
                        }
                    },
                    ColumnSource::CompositeLookup {
                        resolver,
                        field: name,
                        foreign_field,
                    } => match (self.resolver(resolver)?, field(name), field(foreign_field)) {
                        (BuiltResolver::Combined(r), Some(local), Some(foreign)) => {
                            Cell::from(r.unresolved((local.to_string(), foreign.to_string())))
                        }
                        (BuiltResolver::Combined(_), _, _) => Cell::null(),
                        (BuiltResolver::Single(_), _, _) => {
                            return Err(anyhow!(
                                "column {column}: {resolver} is not a combined resolver"
                            ))
                        }
                    },
                };
                Ok(cell)
            })
            .collect()
    }

    /// Feeds every record through each table's batch and writes what remains at the end.
    ///
    /// A transactional step commits once at the end and leaves nothing behind on error;
    /// otherwise chunks written before an error stay written.
    #[instrument(skip(self, records), fields(tables = %self.mapping.label()))]
    pub fn run<I>(mut self, records: I) -> Result<ImportSummary>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        let mut progress = Progress::new(self.mapping.label(), env_util::progress_interval());
        let db = Rc::clone(&self.db);

        if self.mapping.transactional {
            db.transactional(|| self.load(records, &mut progress))?;
        } else {
            self.load(records, &mut progress)?;
        }
        progress.finish();

        let summary = ImportSummary {
            records: progress.processed(),
            tables: self
                .tables
                .iter()
                .map(|job| TableSummary {
                    table: job.mapping.table.clone(),
                    stats: job.batch.stats(),
                })
                .collect(),
            elapsed_ms: progress.elapsed().as_millis(),
        };
        let total = summary.total();
        info!(
            target: "import",
            tables = %self.mapping.label(),
            records = summary.records,
            rows_written = total.rows_written,
            rows_dropped = total.rows_dropped,
            fields_nulled = total.fields_nulled,
            statements = total.statements,
            "import step finished"
        );
        Ok(summary)
    }

    fn load<I>(&mut self, records: I, progress: &mut Progress) -> Result<()>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        for record in records {
            let record = record?;
            // Rows are queued for every table before any of them flushes, so all lookups of
            // one record land in the same resolution pass.
            let rows = self
                .tables
                .iter()
                .map(|job| self.project(&job.mapping, &record))
                .collect::<Result<Vec<_>>>()?;
            for (job, row) in self.tables.iter_mut().zip(rows) {
                job.batch.with_row(row);
                job.batch
                    .flush_if_over_limit(&self.db)
                    .with_context(|| format!("writing {}", job.mapping.table))?;
            }
            progress.tick();
        }
        for job in &mut self.tables {
            job.batch
                .execute_if_not_empty(&self.db)
                .with_context(|| format!("writing {}", job.mapping.table))?;
        }
        Ok(())
    }
}

fn build_batch(
    target: &TableMapping,
    resolvers: &IndexMap<String, BuiltResolver>,
    limit: usize,
) -> Result<BatchUpsert> {
    let mut upsert = Upsert::new(&target.table, target.columns.keys())
        .on_duplicate(&target.on_duplicate)
        .with_limit(limit);
    if target.null_on_unresolved {
        upsert = upsert.with_null_on_unresolved();
    }
    for (column, template) in &target.formatted {
        upsert = upsert.with_formatted(column, template);
    }
    for resolver in resolvers.values() {
        upsert = match resolver {
            BuiltResolver::Single(r) => upsert.with_resolver(r.clone()),
            BuiltResolver::Combined(r) => upsert.with_resolver(r.clone()),
        };
    }
    upsert
        .build()
        .with_context(|| format!("building batch for {}", target.table))
}
