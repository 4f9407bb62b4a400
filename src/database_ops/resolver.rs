use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::database_ops::combined_table::CombinedTableResolver;
use crate::database_ops::db::Db;
use crate::database_ops::error::Result;
use crate::database_ops::identifier::{Identifier, ResolverId};
use crate::database_ops::single_table::SingleTableResolver;
use crate::database_ops::value::SqlValue;

/// Keys bound per lookup query.
pub(crate) const LOOKUP_BATCH: usize = 512;

/// The half of a resolver the batch builder needs: turning identifiers into keys and handing
/// consumed placeholders back.
pub trait Resolve {
    fn id(&self) -> ResolverId;

    /// Resolves every pending key of this resolver, then answers for `identifier`.
    ///
    /// Fails with `IdentifierNotResolved` for unknown keys and for placeholders owned by
    /// another resolver; store errors pass through.
    fn resolve(&self, identifier: &Identifier) -> Result<i64>;

    /// Gives back one reference obtained from `unresolved`.
    fn release(&self, identifier: Identifier);
}

/// A resolver that also issues placeholders for its natural key type.
pub trait IdResolver: Resolve {
    type Key;

    fn unresolved(&self, key: Self::Key) -> Identifier;
}

/// Static predicate (`column IN (values)`, AND-ed) scoping a resolver's lookups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Vec<SqlValue>)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<SqlValue>>,
    ) -> Self {
        self.conditions
            .push((column.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Columns pinned to exactly one value; these are copied into allocation templates.
    pub fn pinned(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.conditions.iter().filter_map(|(column, values)| match values.as_slice() {
            [value] => Some((column.as_str(), value)),
            _ => None,
        })
    }

    /// Appends the filter's `(column, count)` pairs and bind values.
    pub(crate) fn extend_query<'a>(
        &'a self,
        conditions: &mut Vec<(&'a str, usize)>,
        params: &mut Vec<SqlValue>,
    ) {
        for (column, values) in &self.conditions {
            conditions.push((column.as_str(), values.len()));
            params.extend(values.iter().cloned());
        }
    }
}

/// Maps values read back from a search column to the requested keys they answer for.
///
/// SQLite compares a bound text key against the column's affinity, so `'000001'` matches a
/// stored integer `1`. Text values match exactly; numeric values match every requested key
/// that reads as the same number.
pub(crate) struct KeyIndex<'a> {
    text: HashSet<&'a str>,
    integers: HashMap<i64, Vec<&'a str>>,
    reals: Vec<(f64, &'a str)>,
}

impl<'a> KeyIndex<'a> {
    pub(crate) fn new(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut index = Self {
            text: HashSet::new(),
            integers: HashMap::new(),
            reals: Vec::new(),
        };
        for key in keys {
            index.text.insert(key);
            let trimmed = key.trim();
            if let Ok(value) = trimmed.parse::<i64>() {
                index.integers.entry(value).or_default().push(key);
            } else if let Ok(value) = trimmed.parse::<f64>() {
                if value.is_finite() {
                    index.reals.push((value, key));
                }
            }
        }
        index
    }

    /// Requested keys equal to `stored`.
    pub(crate) fn matching(&self, stored: &SqlValue) -> Vec<&'a str> {
        match stored {
            SqlValue::Null => Vec::new(),
            SqlValue::Text(text) => self.text.get(text.as_str()).copied().into_iter().collect(),
            SqlValue::Integer(value) => {
                let mut keys = self.integers.get(value).cloned().unwrap_or_default();
                let as_real = *value as f64;
                keys.extend(self.reals.iter().filter(|(v, _)| *v == as_real).map(|(_, k)| *k));
                keys
            }
            SqlValue::Real(value) => {
                let mut keys: Vec<&str> = self
                    .reals
                    .iter()
                    .filter(|(v, _)| v == value)
                    .map(|(_, k)| *k)
                    .collect();
                if value.fract() == 0.0 {
                    if let Some(found) = self.integers.get(&(*value as i64)) {
                        keys.extend(found.iter().copied());
                    }
                }
                keys
            }
        }
    }
}

/// Builds resolvers bound to one write connection.
#[derive(Debug, Clone)]
pub struct ResolverFactory {
    db: Rc<Db>,
}

impl ResolverFactory {
    pub fn new(db: Rc<Db>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Rc<Db> {
        &self.db
    }

    /// Resolver mapping `search` values of `table` to its `target` key column.
    pub fn single(&self, table: &str, search: &str, target: &str) -> SingleTableResolver {
        SingleTableResolver::new(Rc::clone(&self.db), table, search, target)
    }

    /// Resolver for `(search value, foreign natural key)` pairs of a junction `table`; the
    /// foreign natural key is turned into `foreign` column ids by `foreign_resolver`.
    pub fn combined(
        &self,
        table: &str,
        target: &str,
        search: &str,
        foreign: &str,
        foreign_resolver: Rc<dyn IdResolver<Key = String>>,
    ) -> CombinedTableResolver {
        CombinedTableResolver::new(
            Rc::clone(&self.db),
            table,
            search,
            target,
            foreign,
            foreign_resolver,
        )
    }
}
