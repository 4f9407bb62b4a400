//! Deferred identifier resolution and batched upserts on SQLite.

pub mod combined_table;
pub mod db;
pub mod error;
pub mod identifier;
pub mod resolver;
pub mod single_table;
pub mod sql;
pub mod upsert;
pub mod value;

#[cfg(test)]
pub(crate) mod fixtures;

pub use combined_table::{CombinedTableResolver, CompositeKey};
pub use db::{ConnectionPool, Db, DbConfig};
pub use error::{Error, Result};
pub use identifier::{Identifier, ResolverId};
pub use resolver::{Filter, IdResolver, Resolve, ResolverFactory};
pub use single_table::SingleTableResolver;
pub use upsert::{BatchStats, BatchUpsert, Upsert, UpsertPlan};
pub use value::{Cell, SqlValue};
