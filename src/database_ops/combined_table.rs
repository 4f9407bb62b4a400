use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, instrument};

use crate::database_ops::db::Db;
use crate::database_ops::error::{Error, Result};
use crate::database_ops::identifier::{IdentityCache, Identifier, ResolverId};
use crate::database_ops::resolver::{IdResolver, KeyIndex, Resolve, LOOKUP_BATCH};
use crate::database_ops::sql::{insert_returning_sql, select_in_sql};
use crate::database_ops::value::SqlValue;

/// `(search value, foreign natural key)`.
pub type CompositeKey = (String, String);

/// Resolves rows of a junction-style table identified by a local value plus a reference to
/// another table. The reference arrives as a natural key and is resolved by `foreign_resolver`
/// before the junction table is queried.
pub struct CombinedTableResolver {
    id: ResolverId,
    db: Rc<Db>,
    table: String,
    search: String,
    target: String,
    foreign: String,
    foreign_resolver: Rc<dyn IdResolver<Key = String>>,
    allocate: bool,
    cache: RefCell<IdentityCache<CompositeKey>>,
    // One foreign placeholder per distinct foreign key, held until the next pass.
    dependencies: RefCell<IndexMap<String, Identifier>>,
}

impl std::fmt::Debug for CombinedTableResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedTableResolver")
            .field("table", &self.table)
            .field("search", &self.search)
            .field("target", &self.target)
            .field("foreign", &self.foreign)
            .field("foreign_resolver", &self.foreign_resolver.id())
            .field("allocate", &self.allocate)
            .finish()
    }
}

impl CombinedTableResolver {
    pub fn new(
        db: Rc<Db>,
        table: &str,
        search: &str,
        target: &str,
        foreign: &str,
        foreign_resolver: Rc<dyn IdResolver<Key = String>>,
    ) -> Self {
        let id = ResolverId::next();
        Self {
            id,
            db,
            table: table.to_string(),
            search: search.to_string(),
            target: target.to_string(),
            foreign: foreign.to_string(),
            foreign_resolver,
            allocate: true,
            cache: RefCell::new(IdentityCache::new(id)),
            dependencies: RefCell::new(IndexMap::new()),
        }
    }

    /// Disables speculative allocation: composites without a row stay unresolved.
    pub fn lookup_only(mut self) -> Self {
        self.allocate = false;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> [&str; 3] {
        [self.target.as_str(), self.search.as_str(), self.foreign.as_str()]
    }

    pub fn allocates(&self) -> bool {
        self.allocate
    }

    /// Resolves every held foreign dependency. Unresolvable ones are simply absent from the
    /// result; store errors abort.
    fn resolve_dependencies(
        &self,
        dependencies: &IndexMap<String, Identifier>,
    ) -> Result<HashMap<String, i64>> {
        let mut ids = HashMap::with_capacity(dependencies.len());
        for (key, identifier) in dependencies {
            match self.foreign_resolver.resolve(identifier) {
                Ok(id) => {
                    ids.insert(key.clone(), id);
                }
                Err(err) if err.is_not_resolved() => {
                    debug!(
                        target: "resolver",
                        table = %self.table,
                        foreign_key = %key,
                        "foreign key not resolved"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ids)
    }

    fn lookup(
        &self,
        db: &Db,
        keys: &[&CompositeKey],
        foreign_ids: &HashMap<String, i64>,
    ) -> Result<Vec<(CompositeKey, i64)>> {
        let wanted: HashSet<&CompositeKey> = keys.iter().copied().collect();
        let mut by_id: HashMap<i64, Vec<&str>> = HashMap::new();
        for (key, id) in foreign_ids {
            by_id.entry(*id).or_default().push(key.as_str());
        }

        let mut found = Vec::new();
        for chunk in keys.chunks(LOOKUP_BATCH / 2) {
            let locals: IndexSet<&str> = chunk.iter().map(|(local, _)| local.as_str()).collect();
            let index = KeyIndex::new(locals.iter().copied());
            let ids: IndexSet<i64> = chunk
                .iter()
                .filter_map(|(_, foreign)| foreign_ids.get(foreign).copied())
                .collect();

            let sql = select_in_sql(
                &self.table,
                &[self.target.as_str(), self.search.as_str(), self.foreign.as_str()],
                &[(self.search.as_str(), locals.len()), (self.foreign.as_str(), ids.len())],
            );
            let params: Vec<SqlValue> = locals
                .iter()
                .map(|local| SqlValue::from(*local))
                .chain(ids.iter().map(|id| SqlValue::Integer(*id)))
                .collect();

            for row in db.query_rows(&sql, &params, 3)? {
                let (Some(target), Some(foreign_id)) = (row[0].as_i64(), row[2].as_i64()) else {
                    continue;
                };
                for local in index.matching(&row[1]) {
                    for foreign_key in by_id.get(&foreign_id).into_iter().flatten() {
                        let key = (local.to_string(), foreign_key.to_string());
                        if wanted.contains(&key) {
                            found.push((key, target));
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    fn allocate(
        &self,
        keys: &[&CompositeKey],
        foreign_ids: &HashMap<String, i64>,
    ) -> Result<Vec<(CompositeKey, i64)>> {
        let columns = vec![self.search.clone(), self.foreign.clone()];
        let sql = insert_returning_sql(&self.table, &columns, &self.target);

        // The foreign id may itself be reserved and not written yet.
        self.db.without_foreign_key_checks(|db| {
            db.rolled_back("combined_allocate", |db| {
                let mut allocated = Vec::with_capacity(keys.len());
                for key in keys {
                    let Some(foreign_id) = foreign_ids.get(&key.1) else {
                        continue;
                    };
                    let params = [SqlValue::from(key.0.as_str()), SqlValue::Integer(*foreign_id)];
                    let reserved = db.insert_reserving(&self.table, &self.target, &sql, &params)?;
                    if let Some(id) = reserved {
                        allocated.push(((*key).clone(), id));
                    }
                }
                Ok(allocated)
            })
        })
    }

    #[instrument(
        level = "debug",
        skip(self, keys, dependencies),
        fields(table = %self.table, keys = keys.len())
    )]
    fn resolve_keys(
        &self,
        keys: &[CompositeKey],
        dependencies: &IndexMap<String, Identifier>,
    ) -> Result<Vec<(CompositeKey, i64)>> {
        let foreign_ids = self.resolve_dependencies(dependencies)?;

        // Composites whose foreign part failed are out of this pass.
        let candidates: Vec<&CompositeKey> = keys
            .iter()
            .filter(|(_, foreign)| foreign_ids.contains_key(foreign))
            .collect();
        if candidates.is_empty() {
            debug!(
                target: "resolver",
                table = %self.table,
                requested = keys.len(),
                "no foreign keys resolved"
            );
            return Ok(Vec::new());
        }

        let mut found = self.lookup(&self.db, &candidates, &foreign_ids)?;
        let existing = found.len();

        if self.allocate && found.len() < candidates.len() {
            let seen: HashSet<&CompositeKey> = found.iter().map(|(k, _)| k).collect();
            let missing: Vec<&CompositeKey> = candidates
                .iter()
                .copied()
                .filter(|k| !seen.contains(k))
                .collect();
            let allocated = self.allocate(&missing, &foreign_ids)?;
            found.extend(allocated);
        }

        debug!(
            target: "resolver",
            table = %self.table,
            requested = keys.len(),
            existing,
            allocated = found.len() - existing,
            "composite resolution pass"
        );
        Ok(found)
    }

    fn resolve_pending(&self) -> Result<()> {
        let keys = self.cache.borrow_mut().take_pending();
        if keys.is_empty() {
            return Ok(());
        }
        let dependencies = std::mem::take(&mut *self.dependencies.borrow_mut());

        match self.resolve_keys(&keys, &dependencies) {
            Ok(found) => {
                let mut cache = self.cache.borrow_mut();
                for (key, id) in found {
                    cache.mark_resolved(key, id);
                }
                drop(cache);
                for (_, identifier) in dependencies {
                    self.foreign_resolver.release(identifier);
                }
                Ok(())
            }
            Err(err) => {
                self.cache.borrow_mut().restore_pending(keys);
                let mut held = self.dependencies.borrow_mut();
                for (key, identifier) in dependencies {
                    if held.contains_key(&key) {
                        self.foreign_resolver.release(identifier);
                    } else {
                        held.insert(key, identifier);
                    }
                }
                Err(err)
            }
        }
    }

    /// Foreign placeholders currently held for the next pass.
    pub fn held_dependencies(&self) -> usize {
        self.dependencies.borrow().len()
    }
}

impl Resolve for CombinedTableResolver {
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

impl IdResolver for CombinedTableResolver {
    type Key = CompositeKey;

    fn unresolved(&self, key: CompositeKey) -> Identifier {
        let foreign_key = key.1.clone();
        let identifier = self.cache.borrow_mut().unresolved(key);
        if identifier.is_resolved() {
            return identifier;
        }

        let mut dependencies = self.dependencies.borrow_mut();
        if !dependencies.contains_key(&foreign_key) {
            let dependency = self.foreign_resolver.unresolved(foreign_key.clone());
            dependencies.insert(foreign_key, dependency);
        }
        identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::fixtures::{fetch_table, fixture_db};
    use crate::database_ops::resolver::ResolverFactory;
    use crate::database_ops::single_table::SingleTableResolver;

    fn key(local: &str, foreign: &str) -> CompositeKey {
        (local.to_string(), foreign.to_string())
    }

    fn resolvers(db: &Rc<Db>) -> (Rc<SingleTableResolver>, CombinedTableResolver) {
        let factory = ResolverFactory::new(Rc::clone(db));
        let simple = Rc::new(factory.single("some_table", "other", "id"));
        let combined = factory.combined(
            "another_table",
            "id",
            "second_other",
            "other_id",
            simple.clone(),
        );
        (simple, combined)
    }

    #[test]
    fn resolves_existing_pairs() {
        let db = fixture_db();
        let (_, combined) = resolvers(&db);

        let first = combined.unresolved(key("value1", "value1"));
        let second = combined.unresolved(key("value1", "value3"));
        let third = combined.unresolved(key("value4", "value4"));

        assert_eq!(combined.resolve(&first).unwrap(), 1);
        assert_eq!(combined.resolve(&second).unwrap(), 2);
        assert_eq!(combined.resolve(&third).unwrap(), 8);
    }

    #[test]
    fn unresolvable_foreign_key_fails_only_its_composites() {
        let db = fixture_db();
        let (_, combined) = resolvers(&db);

        let broken = combined.unresolved(key("value2", "value5"));
        let fine = combined.unresolved(key("value2", "value1"));

        assert!(combined.resolve(&broken).unwrap_err().is_not_resolved());
        assert_eq!(combined.resolve(&fine).unwrap(), 4);
        assert_eq!(fetch_table(&db, "another_table").len(), 5);
    }

    #[test]
    fn missing_pair_gets_a_reserved_id() {
        let db = fixture_db();
        let (_, combined) = resolvers(&db);

        let fresh = combined.unresolved(key("value3", "value3"));
        assert_eq!(combined.resolve(&fresh).unwrap(), 10);
        assert_eq!(fetch_table(&db, "another_table").len(), 5);
    }

    #[test]
    fn allocates_against_a_reserved_foreign_row_with_foreign_keys_on() {
        let db = Rc::new(Db::open_in_memory().unwrap());
        db.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE product (id INTEGER PRIMARY KEY, sku TEXT UNIQUE);
             CREATE TABLE link (
                id INTEGER PRIMARY KEY,
                name TEXT,
                product_id INTEGER REFERENCES product(id)
             );",
        )
        .unwrap();
        let factory = ResolverFactory::new(Rc::clone(&db));
        let products = Rc::new(
            factory
                .single("product", "sku", "id")
                .with_auto_increment(IndexMap::new()),
        );
        let links = factory.combined("link", "id", "name", "product_id", products.clone());

        let link = links.unresolved(key("main", "new-sku"));
        assert_eq!(links.resolve(&link).unwrap(), 1);

        let enforced: bool = db
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert!(enforced);
        assert_eq!(fetch_table(&db, "link").len(), 0);
    }

    #[test]
    fn lookup_only_leaves_missing_pairs_unresolved() {
        let db = fixture_db();
        let (_, combined) = resolvers(&db);
        let combined = combined.lookup_only();

        let fresh = combined.unresolved(key("value3", "value3"));
        assert!(combined.resolve(&fresh).unwrap_err().is_not_resolved());
    }

    #[test]
    fn resolved_pair_survives_release_of_first_holder() {
        let db = fixture_db();
        let (_, combined) = resolvers(&db);

        let value = combined.unresolved(key("value1", "value1"));
        assert_eq!(combined.resolve(&value).unwrap(), 1);
        let again = combined.unresolved(key("value1", "value1"));
        combined.release(value);

        assert_eq!(combined.resolve(&again).unwrap(), 1);
    }

    #[test]
    fn foreign_placeholders_are_released_after_a_pass() {
        let db = fixture_db();
        let (simple, combined) = resolvers(&db);

        let pair = combined.unresolved(key("value1", "value1"));
        combined.unresolved(key("value2", "value1"));
        assert_eq!(combined.held_dependencies(), 1);
        assert_eq!(simple.live_keys(), 1);

        combined.resolve(&pair).unwrap();
        assert_eq!(combined.held_dependencies(), 0);
        assert_eq!(simple.live_keys(), 0);
    }
}
