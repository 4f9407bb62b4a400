//! CSV-to-table import steps driven by JSON mappings.

pub mod mapping;
pub mod preflight;
pub mod progress;
pub mod run;
pub mod source;

pub use mapping::{ColumnSource, ImportMapping, ResolverSpec, TableMapping};
pub use preflight::{preflight, SchemaProblem};
pub use run::{ImportJob, ImportSummary, TableSummary};
pub use source::{open_records, read_records, Record};
