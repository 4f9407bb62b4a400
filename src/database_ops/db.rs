use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::database_ops::error::Result;
use crate::database_ops::sql::update_key_sql;
use crate::database_ops::value::SqlValue;
use crate::util::env as env_util;

pub const DEFAULT_STATEMENT_CACHE: usize = 64;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Synchronous handle on one SQLite connection.
///
/// Resolvers and batch builders share the write connection through `Rc<Db>`; every call is a
/// blocking round trip.
#[derive(Debug)]
pub struct Db {
    conn: Connection,
    // Highest key handed out by a rolled-back allocation, per table.
    reserved: RefCell<HashMap<String, i64>>,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        conn.set_prepared_statement_cache_capacity(DEFAULT_STATEMENT_CACHE);
        Self {
            conn,
            reserved: RefCell::new(HashMap::new()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Runs a parameterized statement through the prepared statement cache.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))?)
    }

    /// Runs one or more parameterless statements (DDL, pragmas).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// Fetches every row, reading the first `width` columns of each.
    pub fn query_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
        width: usize,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            (0..width)
                .map(|idx| row.get::<_, rusqlite::types::Value>(idx).map(SqlValue::from))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Executes an `INSERT ... RETURNING <key>` and reads the generated key back; `None` when
    /// the insert was skipped by its conflict clause.
    pub fn insert_returning(&self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt
            .query_row(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))
            .optional()?)
    }

    /// Inserts one allocation row and returns its key, never repeating a key reserved earlier
    /// on `table`.
    ///
    /// Rolling back an allocation rewinds SQLite's rowid counter, so the next insert can be
    /// handed a key that still belongs to an unwritten row. Such a key is moved past the
    /// table's reservation mark before it is returned.
    pub fn insert_reserving(
        &self,
        table: &str,
        target: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<i64>> {
        let Some(id) = self.insert_returning(sql, params)? else {
            return Ok(None);
        };
        let mark = self.reserved_mark(table);
        let id = match mark {
            Some(mark) if id <= mark => {
                let moved = mark + 1;
                self.execute(
                    &update_key_sql(table, target),
                    &[SqlValue::Integer(moved), SqlValue::Integer(id)],
                )?;
                debug!(target: "db", table, from = id, to = moved, "moved reserved key past mark");
                moved
            }
            _ => id,
        };
        self.reserved.borrow_mut().insert(table.to_string(), id);
        Ok(Some(id))
    }

    /// Highest key reserved on `table` so far.
    pub fn reserved_mark(&self, table: &str) -> Option<i64> {
        self.reserved.borrow().get(table).copied()
    }

    /// Runs `work` inside a savepoint that is always rolled back.
    ///
    /// Writes made by `work` never persist, but values it reads back (such as generated keys)
    /// are returned. A savepoint nests inside a caller's open transaction.
    pub fn rolled_back<T>(&self, name: &str, work: impl FnOnce(&Db) -> Result<T>) -> Result<T> {
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        let outcome = work(self);
        let undo = self
            .conn
            .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"));
        debug!(target: "db", savepoint = name, "savepoint rolled back");
        match (outcome, undo) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err.into()),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// Runs `work` in a transaction that commits on success and rolls back on error.
    pub fn transactional<T, E>(
        &self,
        work: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        self.conn.execute_batch("BEGIN")?;
        match work() {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                self.conn.execute_batch("ROLLBACK")?;
                Err(err)
            }
        }
    }

    /// Runs `work` with foreign key enforcement relaxed.
    ///
    /// Outside a transaction enforcement is switched off and restored afterwards. Inside one,
    /// `foreign_keys` cannot change, so checks are deferred to commit instead.
    pub fn without_foreign_key_checks<T>(&self, work: impl FnOnce(&Db) -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("PRAGMA defer_foreign_keys = ON")?;
            return work(self);
        }

        let enforced: bool = self
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if !enforced {
            return work(self);
        }

        self.conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        let outcome = work(self);
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;
        outcome
    }

    /// Column names of `table` in declaration order; empty when the table does not exist.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name FROM pragma_table_info(?1)")?;
        let names = stmt.query_map([table], |row| row.get::<_, String>(0))?;
        Ok(names.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Connection settings for an import run.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub statement_cache: usize,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            statement_cache: DEFAULT_STATEMENT_CACHE,
        }
    }

    /// Reads `IMPORT_DB_PATH`, `IMPORT_BUSY_TIMEOUT_MS` and `IMPORT_STATEMENT_CACHE`.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = env_util::env_req("IMPORT_DB_PATH")?;
        Ok(Self::new(path).with_env_overrides())
    }

    /// Applies the tuning variables on top of an explicit path.
    pub fn with_env_overrides(mut self) -> Self {
        self.busy_timeout = Duration::from_millis(env_util::env_parse(
            "IMPORT_BUSY_TIMEOUT_MS",
            DEFAULT_BUSY_TIMEOUT_MS,
        ));
        self.statement_cache =
            env_util::env_parse("IMPORT_STATEMENT_CACHE", DEFAULT_STATEMENT_CACHE);
        self
    }
}

/// Hands out the write connection used for resolution and upserts, and a separate read-only
/// connection for inspection that never observes half-built state through the writer.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    config: DbConfig,
}

impl ConnectionPool {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    #[instrument(skip(self), fields(path = %self.config.path.display()))]
    pub fn write(&self) -> Result<Db> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let db = self.open(flags)?;
        info!(target: "db", "opened write connection");
        Ok(db)
    }

    #[instrument(skip(self), fields(path = %self.config.path.display()))]
    pub fn read(&self) -> Result<Db> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let db = self.open(flags)?;
        info!(target: "db", "opened read connection");
        Ok(db)
    }

    fn open(&self, flags: OpenFlags) -> Result<Db> {
        let conn = Connection::open_with_flags(&self.config.path, flags)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.set_prepared_statement_cache_capacity(self.config.statement_cache);
        Ok(Db {
            conn,
            reserved: RefCell::new(HashMap::new()),
        })
    }
}
