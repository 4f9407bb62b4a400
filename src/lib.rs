pub mod cli;
pub mod database_ops;
pub mod importer;
pub mod tracing;

pub mod util {
    pub mod env;
}

pub use database_ops::{
    BatchStats, BatchUpsert, Cell, CombinedTableResolver, Db, Error, IdResolver, Identifier,
    Resolve, ResolverFactory, SingleTableResolver, SqlValue, Upsert,
};
pub use importer::{ImportJob, ImportMapping, ImportSummary};
