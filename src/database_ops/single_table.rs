use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, instrument};

use crate::database_ops::db::Db;
use crate::database_ops::error::{Error, Result};
use crate::database_ops::identifier::{IdentityCache, Identifier, ResolverId};
use crate::database_ops::resolver::{Filter, IdResolver, KeyIndex, Resolve, LOOKUP_BATCH};
use crate::database_ops::sql::{insert_returning_sql, select_in_sql};
use crate::database_ops::value::SqlValue;

/// Resolves natural keys held in one column (`search`) to the table's surrogate key (`target`).
///
/// With an auto-increment template, keys that have no row yet get an id reserved by inserting a
/// templated row inside a savepoint that is rolled back right after. The reserved id is only
/// valid if the caller writes a row under it before anything else allocates.
#[derive(Debug)]
pub struct SingleTableResolver {
    id: ResolverId,
    db: Rc<Db>,
    table: String,
    search: String,
    target: String,
    filter: Filter,
    template: Option<IndexMap<String, SqlValue>>,
    cache: RefCell<IdentityCache<String>>,
}

impl SingleTableResolver {
    pub fn new(db: Rc<Db>, table: &str, search: &str, target: &str) -> Self {
        let id = ResolverId::next();
        Self {
            id,
            db,
            table: table.to_string(),
            search: search.to_string(),
            target: target.to_string(),
            filter: Filter::default(),
            template: None,
            cache: RefCell::new(IdentityCache::new(id)),
        }
    }

    /// Restricts lookups and allocation to rows matching `filter`.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Enables speculative allocation; `template` holds the values of every other column the
    /// reserved row needs. A template value for the search column is ignored.
    pub fn with_auto_increment(mut self, template: IndexMap<String, SqlValue>) -> Self {
        self.template = Some(template);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn search_column(&self) -> &str {
        &self.search
    }

    pub fn target_column(&self) -> &str {
        &self.target
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn allocates(&self) -> bool {
        self.template.is_some()
    }

    /// Columns written when reserving an id: template columns, pinned filter columns the
    /// template does not set, then the search column.
    pub fn allocation_columns(&self) -> Vec<String> {
        self.allocation_row().0
    }

    fn allocation_row(&self) -> (Vec<String>, Vec<SqlValue>) {
        let mut row: IndexMap<String, SqlValue> = IndexMap::new();
        if let Some(template) = &self.template {
            for (column, value) in template {
                if column != &self.search {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        for (column, value) in self.filter.pinned() {
            if column != self.search && !row.contains_key(column) {
                row.insert(column.to_string(), value.clone());
            }
        }
        row.into_iter().unzip()
    }

    fn lookup(&self, db: &Db, keys: &[&str]) -> Result<Vec<(String, i64)>> {
        let mut found = Vec::new();

        for chunk in keys.chunks(LOOKUP_BATCH) {
            let index = KeyIndex::new(chunk.iter().copied());
            let mut conditions = vec![(self.search.as_str(), chunk.len())];
            let mut params: Vec<SqlValue> = chunk.iter().map(|k| SqlValue::from(*k)).collect();
            self.filter.extend_query(&mut conditions, &mut params);

            let select = [self.target.as_str(), self.search.as_str()];
            let sql = select_in_sql(&self.table, &select, &conditions);
            for row in db.query_rows(&sql, &params, 2)? {
                let Some(id) = row[0].as_i64() else {
                    continue;
                };
                for key in index.matching(&row[1]) {
                    found.push((key.to_string(), id));
                }
            }
        }

        Ok(found)
    }

    fn allocate(&self, keys: &[&str]) -> Result<Vec<(String, i64)>> {
        let (mut columns, base) = self.allocation_row();
        columns.push(self.search.clone());
        let sql = insert_returning_sql(&self.table, &columns, &self.target);

        // Foreign keys of the template may point at rows that are only reserved themselves.
        self.db.without_foreign_key_checks(|db| {
            db.rolled_back("resolver_allocate", |db| {
                for key in keys {
                    let mut params = base.clone();
                    params.push(SqlValue::from(*key));
                    db.insert_reserving(&self.table, &self.target, &sql, &params)?;
                }
                // Only rows the filter can see count as resolved.
                self.lookup(db, keys)
            })
        })
    }

    #[instrument(level = "debug", skip(self, keys), fields(table = %self.table, keys = keys.len()))]
    fn resolve_keys(&self, keys: &[String]) -> Result<Vec<(String, i64)>> {
        let requested: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut found = self.lookup(&self.db, &requested)?;
        let existing = found.len();

        if self.template.is_some() && found.len() < requested.len() {
            let seen: HashSet<&str> = found.iter().map(|(k, _)| k.as_str()).collect();
            let missing: Vec<&str> = requested
                .iter()
                .copied()
                .filter(|k| !seen.contains(k))
                .collect();
            let allocated = self.allocate(&missing)?;
            found.extend(allocated);
        }

        debug!(
            target: "resolver",
            table = %self.table,
            requested = requested.len(),
            existing,
            allocated = found.len() - existing,
            "resolution pass"
        );
        Ok(found)
    }

    fn resolve_pending(&self) -> Result<()> {
        let keys = self.cache.borrow_mut().take_pending();
        if keys.is_empty() {
            return Ok(());
        }

        match self.resolve_keys(&keys) {
            Ok(found) => {
                let mut cache = self.cache.borrow_mut();
                for (key, id) in found {
                    cache.mark_resolved(key, id);
                }
                Ok(())
            }
            Err(err) => {
                self.cache.borrow_mut().restore_pending(keys);
                Err(err)
            }
        }
    }

    /// Number of keys currently referenced by live placeholders.
    pub fn live_keys(&self) -> usize {
        self.cache.borrow().live_len()
    }
}

impl Resolve for SingleTableResolver {
    fn id(&self) -> ResolverId {
        self.id
    }

    fn resolve(&self, identifier: &Identifier) -> Result<i64> {
        match identifier {
            Identifier::Resolved(value) => Ok(*value),
            Identifier::Unresolved(placeholder) if placeholder.owner() != self.id => Err(
                Error::not_resolved(format!("{placeholder:?} is not owned by {}", self.table)),
            ),
            Identifier::Unresolved(_) => {
                self.resolve_pending()?;
                identifier.resolve_with(&self.cache.borrow())
            }
        }
    }

    fn release(&self, identifier: Identifier) {
        self.cache.borrow_mut().release(identifier);
    }
}

impl IdResolver for SingleTableResolver {
    type Key = String;

    fn unresolved(&self, key: String) -> Identifier {
        self.cache.borrow_mut().unresolved(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::fixtures::{fetch_table, fixture_db};
    use crate::database_ops::resolver::ResolverFactory;

    fn resolver() -> SingleTableResolver {
        ResolverFactory::new(fixture_db()).single("some_table", "other", "id")
    }

    #[test]
    fn resolves_existing_values() {
        let resolver = resolver();
        let ids = ["value1", "value3", "value4"].map(|k| resolver.unresolved(k.to_string()));

        let resolved: Vec<i64> = ids.iter().map(|id| resolver.resolve(id).unwrap()).collect();
        assert_eq!(resolved, vec![1, 3, 4]);
    }

    #[test]
    fn numeric_looking_text_keeps_its_form() {
        let resolver = ResolverFactory::new(fixture_db()).single(
            "table_with_numeric_text",
            "numeric_text",
            "id",
        );
        let ids = ["000001", "123", "123-123"].map(|k| resolver.unresolved(k.to_string()));

        let resolved: Vec<i64> = ids.iter().map(|id| resolver.resolve(id).unwrap()).collect();
        assert_eq!(resolved, vec![1, 2, 3]);
    }

    #[test]
    fn repeated_requests_share_a_placeholder() {
        let resolver = resolver();
        assert_eq!(
            resolver.unresolved("value1".to_string()),
            resolver.unresolved("value1".to_string())
        );
    }

    #[test]
    fn cached_key_survives_release_of_first_holder() {
        let resolver = resolver();
        let first = resolver.unresolved("value1".to_string());
        assert_eq!(resolver.resolve(&first).unwrap(), 1);

        let second = resolver.unresolved("value1".to_string());
        assert_eq!(second, Identifier::Resolved(1));
        resolver.release(first);

        assert_eq!(resolver.resolve(&second).unwrap(), 1);
        assert_eq!(resolver.live_keys(), 0);
    }

    #[test]
    fn unknown_key_is_not_resolved() {
        let resolver = resolver();
        let one = resolver.unresolved("value1".to_string());
        let two = resolver.unresolved("value2".to_string());

        assert_eq!(resolver.resolve(&one).unwrap(), 1);
        assert!(resolver.resolve(&two).unwrap_err().is_not_resolved());
    }

    #[test]
    fn auto_increment_reserves_ids_without_writing() {
        let db = fixture_db();
        let resolver = ResolverFactory::new(Rc::clone(&db))
            .single("some_table", "other", "id")
            .with_auto_increment(IndexMap::from([("other".to_string(), SqlValue::from("value"))]));

        let one = resolver.unresolved("value1".to_string());
        let two = resolver.unresolved("value2".to_string());

        assert_eq!(resolver.resolve(&one).unwrap(), 1);
        assert_eq!(resolver.resolve(&two).unwrap(), 10);
        assert_eq!(fetch_table(&db, "some_table").len(), 5);
    }

    #[test]
    fn new_keys_get_increasing_ids_in_request_order() {
        let db = fixture_db();
        let resolver = ResolverFactory::new(Rc::clone(&db))
            .single("some_table", "other", "id")
            .with_auto_increment(IndexMap::new());

        let ids = ["new-c", "new-a", "new-b"].map(|k| resolver.unresolved(k.to_string()));
        let resolved: Vec<i64> = ids.iter().map(|id| resolver.resolve(id).unwrap()).collect();

        assert_eq!(resolved, vec![10, 11, 12]);
        assert_eq!(fetch_table(&db, "some_table").len(), 5);
    }

    #[test]
    fn later_passes_skip_reserved_ids() {
        let db = fixture_db();
        let factory = ResolverFactory::new(Rc::clone(&db));
        let first = factory
            .single("some_table", "other", "id")
            .with_auto_increment(IndexMap::new());
        let second = factory
            .single("some_table", "other", "id")
            .with_auto_increment(IndexMap::new());

        let a = first.unresolved("new-a".to_string());
        assert_eq!(first.resolve(&a).unwrap(), 10);
        let b = first.unresolved("new-b".to_string());
        assert_eq!(first.resolve(&b).unwrap(), 11);
        let c = second.unresolved("new-c".to_string());
        assert_eq!(second.resolve(&c).unwrap(), 12);

        assert_eq!(db.reserved_mark("some_table"), Some(12));
        assert_eq!(fetch_table(&db, "some_table").len(), 5);
    }

    #[test]
    fn integer_search_column_matches_numeric_text() {
        let db = fixture_db();
        db.execute_batch(
            "CREATE TABLE coded (id INTEGER PRIMARY KEY, code INTEGER);
             INSERT INTO coded (id, code) VALUES (1, 1), (2, 123);",
        )
        .unwrap();
        let resolver = ResolverFactory::new(db).single("coded", "code", "id");

        let ids = ["000001", "123", "1"].map(|k| resolver.unresolved(k.to_string()));
        let resolved: Vec<i64> = ids.iter().map(|id| resolver.resolve(id).unwrap()).collect();
        assert_eq!(resolved, vec![1, 2, 1]);
    }

    #[test]
    fn filter_limits_lookup() {
        let resolver = resolver().with_filter(Filter::new().with("id", [1_i64, 3]));

        let one = resolver.unresolved("value1".to_string());
        let three = resolver.unresolved("value3".to_string());
        let four = resolver.unresolved("value4".to_string());

        assert_eq!(resolver.resolve(&one).unwrap(), 1);
        assert_eq!(resolver.resolve(&three).unwrap(), 3);
        assert!(resolver.resolve(&four).unwrap_err().is_not_resolved());
    }

    #[test]
    fn pinned_filter_columns_reach_the_template() {
        let db = fixture_db();
        db.execute_batch(
            "CREATE TABLE scoped (id INTEGER PRIMARY KEY, code TEXT, store_id INTEGER NOT NULL);
             INSERT INTO scoped (id, code, store_id) VALUES (1, 'a', 0), (2, 'a', 1);",
        )
        .unwrap();

        let resolver = ResolverFactory::new(Rc::clone(&db))
            .single("scoped", "code", "id")
            .with_filter(Filter::new().with("store_id", [1_i64]))
            .with_auto_increment(IndexMap::new());
        assert_eq!(resolver.allocation_columns(), vec!["store_id".to_string()]);

        let existing = resolver.unresolved("a".to_string());
        let fresh = resolver.unresolved("b".to_string());
        assert_eq!(resolver.resolve(&existing).unwrap(), 2);
        assert_eq!(resolver.resolve(&fresh).unwrap(), 3);
    }

    #[test]
    fn foreign_placeholder_is_rejected() {
        let factory = ResolverFactory::new(fixture_db());
        let mine = factory.single("some_table", "other", "id");
        let theirs = factory.single("some_table", "other", "id");

        let foreign = theirs.unresolved("value1".to_string());
        assert!(mine.resolve(&foreign).unwrap_err().is_not_resolved());
        assert_eq!(theirs.resolve(&foreign).unwrap(), 1);
    }

    #[test]
    fn store_error_keeps_keys_pending() {
        let resolver = ResolverFactory::new(fixture_db()).single("missing_table", "other", "id");
        let id = resolver.unresolved("value1".to_string());

        let err = resolver.resolve(&id).unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(resolver.cache.borrow().has_pending());
    }
}
