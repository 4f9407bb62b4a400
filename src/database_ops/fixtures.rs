//! Shared test tables: a lookup table with gaps in its ids, a junction-style table keyed by
//! `(other_id, second_other)` and a table whose natural keys look numeric.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::database_ops::db::Db;
use crate::database_ops::value::SqlValue;

pub(crate) fn fixture_db() -> Rc<Db> {
    let db = Db::open_in_memory().expect("in-memory database");
    db.execute_batch(
        "CREATE TABLE some_table (id INTEGER PRIMARY KEY, other VARCHAR(255));
         CREATE INDEX some_table_other ON some_table (other);
         INSERT INTO some_table (id, other) VALUES
            (1, 'value1'), (3, 'value3'), (4, 'value4'), (8, 'value8'), (9, 'value9');

         CREATE TABLE another_table (
            id INTEGER PRIMARY KEY,
            other_id INTEGER,
            second_other VARCHAR(255)
         );
         CREATE INDEX another_table_pair ON another_table (other_id, second_other);
         INSERT INTO another_table (id, other_id, second_other) VALUES
            (1, 1, 'value1'), (2, 3, 'value1'), (4, 1, 'value2'),
            (8, 4, 'value4'), (9, 4, 'value5');

         CREATE TABLE table_with_numeric_text (id INTEGER PRIMARY KEY, numeric_text VARCHAR(255));
         INSERT INTO table_with_numeric_text (id, numeric_text) VALUES
            (1, '000001'), (2, '123'), (3, '123-123');",
    )
    .expect("fixture schema");
    Rc::new(db)
}

pub(crate) fn fetch_table(db: &Db, table: &str) -> Vec<Vec<SqlValue>> {
    let width = db.table_columns(table).expect("columns").len();
    db.query_rows(&format!("SELECT * FROM {table} ORDER BY 1"), &[], width)
        .expect("rows")
}

/// Row helper for `another_table` assertions.
pub(crate) fn another(id: i64, other_id: i64, second_other: &str) -> Vec<SqlValue> {
    vec![
        SqlValue::Integer(id),
        SqlValue::Integer(other_id),
        SqlValue::from(second_other),
    ]
}

pub(crate) fn temp_db_path(label: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "bulk-import-{label}-{}-{seq}.sqlite",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}
