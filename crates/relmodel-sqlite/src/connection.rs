//! SQLite connection implementation.
//!
//! Safe wrapper around a SQLite database handle implementing the blocking
//! [`Connection`] trait from relmodel-core.

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
use relmodel_core::{
    ColumnInfo, Connection, ConnectionError, ConnectionErrorKind, Dialect, Error, QueryError,
    QueryErrorKind, Result, Row, TransactionError, TransactionErrorKind, Value,
};
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for in-memory database.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Enforce FOREIGN KEY constraints (`PRAGMA foreign_keys = ON`).
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    pub create: bool,
    pub uri: bool,
    pub no_mutex: bool,
    pub full_mutex: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: false,
        }
    }
}

impl SqliteConfig {
    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
}

// SAFETY: the handle is only touched while holding the Mutex.
unsafe impl Send for SqliteInner {}

/// A connection to a SQLite database.
///
/// Thread-safe wrapper around a SQLite handle; every call locks an internal
/// mutex, so the connection can be shared as `Arc<dyn Connection>`.
pub struct SqliteConnection {
    inner: Mutex<SqliteInner>,
    path: String,
}

// SAFETY: all access to the raw handle goes through the Mutex
unsafe impl Send for SqliteConnection {}
unsafe impl Sync for SqliteConnection {}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Open a new SQLite connection with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db is valid, errmsg returns a valid C string
                unsafe {
                    let msg = CStr::from_ptr(ffi::sqlite3_errmsg(db))
                        .to_string_lossy()
                        .into_owned();
                    ffi::sqlite3_close(db);
                    msg
                }
            };

            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to open database: {}", msg),
                source: None,
            }));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int);
            }
        }

        let conn = Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
            }),
            path: config.path.clone(),
        };
        if config.foreign_keys {
            conn.execute_raw("PRAGMA foreign_keys = ON")?;
        }
        tracing::debug!(path = %config.path, "opened sqlite database");
        Ok(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database.
    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Execute SQL directly without preparing (for DDL, multi-statement scripts).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let inner = self.lock();
        exec_raw(inner.db, sql)
    }

    /// Get the number of rows changed by the last statement.
    pub fn changes(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        i64::from(unsafe { ffi::sqlite3_changes(inner.db) })
    }

    fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let inner = self.lock();
        let stmt = prepare_stmt(inner.db, sql)?;
        let stmt = Statement(stmt);
        bind_params(inner.db, stmt.0, sql, params)?;

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.0) };
        let col_names: Vec<String> = (0..col_count)
            .map(|i| {
                // SAFETY: stmt is valid and i < col_count
                unsafe { types::column_name(stmt.0, i) }.unwrap_or_else(|| format!("col{}", i))
            })
            .collect();
        let columns = Arc::new(ColumnInfo::new(col_names));

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            let rc = unsafe { ffi::sqlite3_step(stmt.0) };
            match rc {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: stmt is valid, we just got SQLITE_ROW
                        .map(|i| unsafe { types::read_column(stmt.0, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break,
                _ => return Err(step_error(inner.db, sql)),
            }
        }

        tracing::trace!(sql = %sql, params = params.len(), rows = rows.len(), "sqlite query");
        Ok(rows)
    }

    fn execute_stmt(&self, sql: &str, params: &[Value]) -> Result<(u64, i64)> {
        let inner = self.lock();
        let stmt = Statement(prepare_stmt(inner.db, sql)?);
        bind_params(inner.db, stmt.0, sql, params)?;

        // SAFETY: stmt is valid
        let rc = unsafe { ffi::sqlite3_step(stmt.0) };
        drop(stmt);

        match rc {
            ffi::SQLITE_DONE | ffi::SQLITE_ROW => {
                // SAFETY: db is valid
                let changes = unsafe { ffi::sqlite3_changes(inner.db) };
                let rowid = unsafe { ffi::sqlite3_last_insert_rowid(inner.db) };
                tracing::trace!(sql = %sql, params = params.len(), changes, "sqlite execute");
                Ok((changes as u64, rowid))
            }
            _ => Err(step_error(inner.db, sql)),
        }
    }

    fn transaction_sql(&self, sql: &str, opening: bool) -> Result<()> {
        let mut inner = self.lock();
        if opening && inner.in_transaction {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "Already in a transaction".to_string(),
            }));
        }
        if !opening && !inner.in_transaction {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: "Not in a transaction".to_string(),
            }));
        }
        exec_raw(inner.db, sql)?;
        inner.in_transaction = opening;
        tracing::debug!(statement = sql, "sqlite transaction state");
        Ok(())
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query_rows(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.execute_stmt(sql, params).map(|(changes, _)| changes)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.execute_stmt(sql, params).map(|(_, rowid)| rowid)
    }

    fn execute_raw(&self, sql: &str) -> Result<()> {
        SqliteConnection::execute_raw(self, sql)
    }

    fn begin(&self) -> Result<()> {
        self.transaction_sql("BEGIN IMMEDIATE", true)
    }

    fn commit(&self) -> Result<()> {
        self.transaction_sql("COMMIT", false)
    }

    fn rollback(&self) -> Result<()> {
        self.transaction_sql("ROLLBACK", false)
    }

    fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    fn last_insert_id(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self.lock();
        if !inner.db.is_null() {
            // SAFETY: db is valid and no statements outlive this connection
            unsafe {
                ffi::sqlite3_close_v2(inner.db);
            }
        }
    }
}

/// Finalizes the wrapped statement when dropped.
struct Statement(*mut ffi::sqlite3_stmt);

impl Drop for Statement {
    fn drop(&mut self) {
        // SAFETY: the pointer came from a successful sqlite3_prepare_v2
        unsafe {
            ffi::sqlite3_finalize(self.0);
        }
    }
}

// Helper functions

fn exec_raw(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let c_sql = CString::new(sql).map_err(|_| {
        Error::Query(QueryError::new(
            QueryErrorKind::Syntax,
            Some(sql),
            "SQL contains null byte",
        ))
    })?;

    let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };

    if rc != ffi::SQLITE_OK {
        let msg = if errmsg.is_null() {
            ffi::error_string(rc).to_string()
        } else {
            // SAFETY: errmsg was allocated by sqlite3_exec
            unsafe {
                let msg = CStr::from_ptr(errmsg).to_string_lossy().into_owned();
                ffi::sqlite3_free(errmsg.cast());
                msg
            }
        };
        return Err(Error::Query(QueryError::new(
            error_code_to_kind(rc),
            Some(sql),
            msg,
        )));
    }
    tracing::trace!(sql = %sql, "sqlite exec");
    Ok(())
}

fn prepare_stmt(db: *mut ffi::sqlite3, sql: &str) -> Result<*mut ffi::sqlite3_stmt> {
    let c_sql = CString::new(sql).map_err(|_| {
        Error::Query(QueryError::new(
            QueryErrorKind::Syntax,
            Some(sql),
            "SQL contains null byte",
        ))
    })?;

    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe {
        ffi::sqlite3_prepare_v2(
            db,
            c_sql.as_ptr(),
            c_sql.as_bytes().len() as c_int,
            &mut stmt,
            ptr::null_mut(),
        )
    };

    if rc != ffi::SQLITE_OK {
        return Err(db_error(db, sql, None));
    }
    Ok(stmt)
}

fn bind_params(
    db: *mut ffi::sqlite3,
    stmt: *mut ffi::sqlite3_stmt,
    sql: &str,
    params: &[Value],
) -> Result<()> {
    for (i, param) in params.iter().enumerate() {
        // SAFETY: stmt is valid, index is 1-based
        let rc = unsafe { types::bind_value(stmt, (i + 1) as c_int, param) };
        if rc != ffi::SQLITE_OK {
            return Err(db_error(db, sql, Some(i + 1)));
        }
    }
    Ok(())
}

fn step_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    db_error(db, sql, None)
}

fn db_error(db: *mut ffi::sqlite3, sql: &str, param_index: Option<usize>) -> Error {
    // SAFETY: db is valid
    let (msg, code) = unsafe {
        let msg = CStr::from_ptr(ffi::sqlite3_errmsg(db))
            .to_string_lossy()
            .into_owned();
        (msg, ffi::sqlite3_errcode(db))
    };
    let message = match param_index {
        Some(i) => format!("Failed to bind parameter {}: {}", i, msg),
        None => msg,
    };
    tracing::debug!(sql = %sql, code, error = %message, "sqlite error");
    Error::Query(QueryError::new(error_code_to_kind(code), Some(sql), message))
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    // extended result codes carry the primary code in the low byte
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_TOOBIG => QueryErrorKind::DataTruncation,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Cancelled,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_with_table() -> SqliteConnection {
        let conn = SqliteConnection::open_memory().expect("open in-memory database");
        conn.execute_raw("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .expect("create table");
        conn
    }

    #[test]
    fn test_open_memory() {
        let conn = SqliteConnection::open_memory().expect("open");
        assert_eq!(conn.path(), ":memory:");
        assert_eq!(conn.dialect(), Dialect::Sqlite);
    }

    #[test]
    fn test_execute_raw_and_changes() {
        let conn = open_with_table();
        conn.execute_raw("INSERT INTO test (name) VALUES ('Alice')")
            .expect("insert");
        assert_eq!(conn.changes(), 1);
        assert_eq!(conn.last_insert_id(), 1);
    }

    #[test]
    fn test_parameterized_query() {
        let conn = open_with_table();
        conn.execute(
            "INSERT INTO test (name, age) VALUES (?1, ?2)",
            &[Value::from("Alice"), Value::Int(30)],
        )
        .expect("insert");

        let rows = conn
            .query("SELECT * FROM test WHERE name = ?1", &[Value::from("Alice")])
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").expect("name"), "Alice");
        assert_eq!(rows[0].get_named::<i64>("age").expect("age"), 30);

        let none = conn
            .query_one("SELECT * FROM test WHERE id = ?1", &[Value::Int(99)])
            .expect("query_one");
        assert!(none.is_none());
    }

    #[test]
    fn test_null_and_types() {
        let conn = SqliteConnection::open_memory().expect("open");
        conn.execute_raw("CREATE TABLE types (b BOOLEAN, f REAL, t TEXT, bl BLOB, n TEXT)")
            .expect("create");
        conn.execute(
            "INSERT INTO types VALUES (?1, ?2, ?3, ?4, ?5)",
            &[
                Value::Bool(true),
                Value::Double(2.5),
                Value::from("hello"),
                Value::Bytes(vec![1, 2, 3]),
                Value::Null,
            ],
        )
        .expect("insert");

        let row = conn
            .query_one("SELECT * FROM types", &[])
            .expect("query")
            .expect("one row");
        assert_eq!(row.get_by_name("b"), Some(&Value::Int(1)));
        assert_eq!(row.get_by_name("f"), Some(&Value::Double(2.5)));
        assert_eq!(row.get_by_name("t"), Some(&Value::from("hello")));
        assert_eq!(row.get_by_name("bl"), Some(&Value::Bytes(vec![1, 2, 3])));
        assert_eq!(row.get_by_name("n"), Some(&Value::Null));
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let conn = open_with_table();

        conn.begin().expect("begin");
        assert!(conn.in_transaction());
        conn.insert("INSERT INTO test (name) VALUES (?1)", &[Value::from("Alice")])
            .expect("insert");
        conn.rollback().expect("rollback");
        assert!(!conn.in_transaction());
        assert!(conn.query("SELECT * FROM test", &[]).expect("query").is_empty());

        conn.begin().expect("begin");
        let id = conn
            .insert("INSERT INTO test (name) VALUES (?1)", &[Value::from("Bob")])
            .expect("insert");
        conn.commit().expect("commit");
        assert_eq!(id, 1);
        assert_eq!(conn.query("SELECT * FROM test", &[]).expect("query").len(), 1);
    }

    #[test]
    fn test_transaction_state_errors() {
        let conn = open_with_table();
        assert!(matches!(
            conn.commit(),
            Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                ..
            }))
        ));
        conn.begin().expect("begin");
        assert!(matches!(
            conn.begin(),
            Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                ..
            }))
        ));
        conn.rollback().expect("rollback");
    }

    #[test]
    fn test_constraint_violation_is_classified() {
        let conn = SqliteConnection::open_memory().expect("open");
        conn.execute_raw("CREATE TABLE u (id INTEGER PRIMARY KEY, email TEXT UNIQUE)")
            .expect("create");
        conn.execute("INSERT INTO u (email) VALUES (?1)", &[Value::from("a@b.c")])
            .expect("first insert");
        let err = conn
            .execute("INSERT INTO u (email) VALUES (?1)", &[Value::from("a@b.c")])
            .expect_err("duplicate email");
        assert!(err.is_constraint_violation());
        assert!(err.sql().is_some_and(|s| s.starts_with("INSERT INTO u")));
    }

    #[test]
    fn test_syntax_error_reports_sql() {
        let conn = SqliteConnection::open_memory().expect("open");
        let err = conn.query("SELEC 1", &[]).expect_err("bad sql");
        assert_eq!(err.sql(), Some("SELEC 1"));
    }
}
