//! Embedded store backend.
//!
//! DuckDB, opened in one of two modes:
//! - file mode: every connection opens the file under a cross-process lock,
//!   so independent worker processes can share one store
//! - shared mode: one database instance per process, connections are cheap
//!   clones and concurrency is left to DuckDB's optimistic transactions

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::types::{TimeUnit, Value, ValueRef};
use thiserror::Error;
use tracing::{debug_span, info, Span};

use crate::frame::DataFrame;
use crate::lock::{LockError, StoreLock};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from embedded store operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Store is locked by another process: {0}")]
    Locked(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Write-write conflict between concurrent transactions.
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] duckdb::arrow::error::ArrowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[source] duckdb::Error),
}

impl BackendError {
    /// True when the error is a transaction conflict that a retry (or a
    /// caller that does not care) may ignore.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<duckdb::Error> for BackendError {
    fn from(err: duckdb::Error) -> Self {
        let message = err.to_string();
        if is_conflict_message(&message) {
            BackendError::Conflict(message)
        } else {
            BackendError::DuckDb(err)
        }
    }
}

impl From<LockError> for BackendError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { path, .. } => BackendError::Locked(path.display().to_string()),
            io @ LockError::Io { .. } => BackendError::Database(io.to_string()),
        }
    }
}

/// DuckDB surfaces transaction conflicts as `TransactionContext Error`s.
fn is_conflict_message(message: &str) -> bool {
    if message.contains("TransactionContext Error") {
        return true;
    }
    let lower = message.to_ascii_lowercase();
    lower.contains("conflict on") || lower.contains("write-write conflict")
}

/// Value type for query parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

macro_rules! db_value_from {
    ($variant:ident: $($ty:ty),+) => {
        $(
            impl From<$ty> for DbValue {
                fn from(v: $ty) -> Self {
                    DbValue::$variant(v.into())
                }
            }
        )+
    };
}

db_value_from!(Integer: i32, i64);
db_value_from!(Real: f64);
db_value_from!(Text: String, &str, &String);
db_value_from!(Boolean: bool);
db_value_from!(Timestamp: DateTime<Utc>);

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(DbValue::Null, Into::into)
    }
}

impl DbValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Boolean(_) => "boolean",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

/// One result row; values are positional, names kept for lookup.
#[derive(Debug, Clone)]
pub struct DbRow {
    columns: Vec<String>,
    values: Vec<DbValue>,
}

impl DbRow {
    pub fn new(columns: Vec<String>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, BackendError> {
        match self.values.get(index) {
            Some(value) => T::from_db_value(value),
            None => Err(BackendError::TypeConversion(format!(
                "no column {} in a row of {}",
                index,
                self.values.len()
            ))),
        }
    }

    pub fn get_by_name<T: FromDbValue>(&self, name: &str) -> Result<T, BackendError> {
        match self.columns.iter().position(|c| c == name) {
            Some(index) => self.get(index),
            None => Err(BackendError::TypeConversion(format!(
                "no column named '{}'",
                name
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }
}

/// Typed extraction from a [`DbValue`]. NULL only converts into `Option<T>`.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError>;
}

fn mismatch(expected: &str, found: &DbValue) -> BackendError {
    match found {
        DbValue::Null => BackendError::TypeConversion(format!(
            "unexpected NULL for {expected}; read nullable columns as Option<{expected}>"
        )),
        other => BackendError::TypeConversion(format!(
            "expected {expected}, found {}",
            other.kind()
        )),
    }
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            other => Err(mismatch("i64", other)),
        }
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            other => Err(mismatch("f64", other)),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            other => Err(mismatch("String", other)),
        }
    }
}

impl FromDbValue for bool {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Boolean(v) => Ok(*v),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl FromDbValue for DateTime<Utc> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Timestamp(v) => Ok(*v),
            DbValue::Text(v) => DateTime::parse_from_rfc3339(v)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| BackendError::TypeConversion(format!("bad timestamp '{}': {}", v, e))),
            other => Err(mismatch("DateTime<Utc>", other)),
        }
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Null => Ok(None),
            _ => T::from_db_value(value).map(Some),
        }
    }
}

enum StoreMode {
    File {
        path: PathBuf,
        lock_timeout: Duration,
    },
    Shared {
        root: Mutex<duckdb::Connection>,
        path: Option<PathBuf>,
    },
}

/// Handle on the embedded store.
///
/// Owns no open connection in file mode; hands out one fresh
/// [`DbConnection`] per operation through [`EmbeddedStore::connect`].
pub struct EmbeddedStore {
    mode: StoreMode,
}

impl std::fmt::Debug for EmbeddedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            StoreMode::File { .. } => "file",
            StoreMode::Shared { .. } => "shared",
        };
        f.debug_struct("EmbeddedStore")
            .field("mode", &mode)
            .field("path", &self.path())
            .finish()
    }
}

impl EmbeddedStore {
    /// Open (or create) a store file that several processes may share.
    ///
    /// Creates the parent directory and the catalog schema if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            mode: StoreMode::File {
                path: path.clone(),
                lock_timeout: DEFAULT_LOCK_TIMEOUT,
            },
        };
        store.ensure_schema()?;
        info!(path = %path.display(), "Embedded store opened");
        Ok(store)
    }

    /// Open a store file owned by this process alone.
    ///
    /// Connections share one database instance and may run concurrently.
    pub fn open_shared(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let root = duckdb::Connection::open(&path)?;
        let store = Self {
            mode: StoreMode::Shared {
                root: Mutex::new(root),
                path: Some(path.clone()),
            },
        };
        store.ensure_schema()?;
        info!(path = %path.display(), "Embedded store opened (shared)");
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let root = duckdb::Connection::open_in_memory()?;
        let store = Self {
            mode: StoreMode::Shared {
                root: Mutex::new(root),
                path: None,
            },
        };
        store.ensure_schema()?;
        info!("Embedded store opened (in-memory)");
        Ok(store)
    }

    /// Maximum wait for the cross-process lock in file mode.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        if let StoreMode::File { lock_timeout, .. } = &mut self.mode {
            *lock_timeout = timeout;
        }
        self
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        match &self.mode {
            StoreMode::File { path, .. } => Some(path.as_path()),
            StoreMode::Shared { path, .. } => path.as_deref(),
        }
    }

    /// Open a connection for one operation.
    ///
    /// In file mode this blocks until the store lock is free, so a thread
    /// must not call it while it still holds another connection to the same
    /// store; pass the held connection down instead.
    pub fn connect(&self) -> Result<DbConnection, BackendError> {
        let connection = self.connect_unscoped()?;
        connection.execute_batch("SET search_path = 'datasets,main'")?;
        Ok(connection)
    }

    /// Connection with the default search path; the `datasets` schema may
    /// not exist yet.
    pub(crate) fn connect_unscoped(&self) -> Result<DbConnection, BackendError> {
        let connection = match &self.mode {
            StoreMode::File { path, lock_timeout } => {
                let guard = StoreLock::acquire(path, *lock_timeout)?;
                let conn = duckdb::Connection::open(path)?;
                DbConnection {
                    conn,
                    _lock_guard: Some(guard),
                }
            }
            StoreMode::Shared { root, .. } => {
                let root = root.lock().map_err(|_| {
                    BackendError::Database("store root connection lock poisoned".to_string())
                })?;
                DbConnection {
                    conn: root.try_clone()?,
                    _lock_guard: None,
                }
            }
        };
        Ok(connection)
    }
}

/// A connection to the embedded store, released on drop.
///
/// Not shared across concurrent operations; open one per operation.
pub struct DbConnection {
    // Field order matters: the connection closes before the lock is released.
    conn: duckdb::Connection,
    _lock_guard: Option<StoreLock>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("backend", &"DuckDB")
            .field("locked", &self._lock_guard.is_some())
            .finish()
    }
}

impl DbConnection {
    /// Execute a SQL statement (no results).
    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute_on_conn(&self.conn, sql, params)
    }

    /// Execute a batch of SQL statements.
    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        execute_batch_on_conn(&self.conn, sql)
    }

    /// Query and return all rows.
    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on_conn(&self.conn, sql, params)
    }

    /// Query and return the first row, if any.
    pub fn query_optional(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        let rows = self.query_all(sql, params)?;
        Ok(rows.into_iter().next())
    }

    /// Query and return exactly one row.
    pub fn query_one(&self, sql: &str, params: &[DbValue]) -> Result<DbRow, BackendError> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))
    }

    /// Query and return a single scalar value.
    pub fn query_scalar<T: FromDbValue>(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        let row = self.query_one(sql, params)?;
        row.get(0)
    }

    /// Query and return the whole result as a dataframe.
    pub fn query_frame(&self, sql: &str, params: &[DbValue]) -> Result<DataFrame, BackendError> {
        query_frame_on_conn(&self.conn, sql, params)
    }

    /// Execute `op` inside BEGIN/COMMIT, rolling back on error.
    pub fn transaction<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(&DbTransaction<'_>) -> Result<T, BackendError>,
    {
        self.conn.execute_batch("BEGIN")?;
        let tx = DbTransaction { conn: &self.conn };
        let result = op(&tx);

        match result {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => match self.conn.execute_batch("ROLLBACK") {
                Ok(()) => Err(err),
                Err(rollback_err) => Err(BackendError::Transaction(format!(
                    "Transaction failed: {}; rollback failed: {}",
                    err, rollback_err
                ))),
            },
        }
    }

    /// Wrap a connection that is not backed by a store (scratch databases).
    pub(crate) fn from_raw(conn: duckdb::Connection) -> Self {
        Self {
            conn,
            _lock_guard: None,
        }
    }

    pub(crate) fn raw(&self) -> &duckdb::Connection {
        &self.conn
    }
}

/// Statements issued inside [`DbConnection::transaction`].
pub struct DbTransaction<'a> {
    conn: &'a duckdb::Connection,
}

impl<'a> DbTransaction<'a> {
    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute_on_conn(self.conn, sql, params)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        execute_batch_on_conn(self.conn, sql)
    }

    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on_conn(self.conn, sql, params)
    }
}

/// Span shared by every statement; `rows` and `duration_ms` are filled in by [`finish`].
fn sql_span(kind: &'static str, sql: &str) -> Span {
    debug_span!(
        "db.sql",
        kind,
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        rows = tracing::field::Empty,
        duration_ms = tracing::field::Empty
    )
}

fn finish(span: &Span, started: Instant, rows: usize) {
    span.record("rows", rows as u64);
    span.record("duration_ms", started.elapsed().as_millis() as u64);
}

fn execute_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<u64, BackendError> {
    let span = sql_span("exec", sql);
    let _entered = span.enter();
    let started = Instant::now();

    let changed = conn
        .prepare(sql)?
        .execute(duckdb::params_from_iter(bind(params)))?;
    finish(&span, started, changed);
    Ok(changed as u64)
}

fn execute_batch_on_conn(conn: &duckdb::Connection, sql: &str) -> Result<(), BackendError> {
    let span = sql_span("batch", sql);
    let _entered = span.enter();
    let started = Instant::now();
    conn.execute_batch(sql)?;
    finish(&span, started, 0);
    Ok(())
}

fn query_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<Vec<DbRow>, BackendError> {
    let span = sql_span("query", sql);
    let _entered = span.enter();
    let started = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(duckdb::params_from_iter(bind(params)))?;
    let Some(columns) = rows.as_ref().map(|s| s.column_names()) else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..columns.len())
            .map(|i| read_value(row, i))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(DbRow::new(columns.clone(), values));
    }
    finish(&span, started, out.len());
    Ok(out)
}

fn query_frame_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<DataFrame, BackendError> {
    let span = sql_span("frame", sql);
    let _entered = span.enter();
    let started = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let arrow = stmt.query_arrow(duckdb::params_from_iter(bind(params)))?;
    let schema = arrow.get_schema();
    let batches: Vec<RecordBatch> = arrow.collect();
    let frame = DataFrame::from_batches(schema, &batches)?;

    finish(&span, started, frame.num_rows());
    Ok(frame)
}

fn bind(params: &[DbValue]) -> Vec<Value> {
    params
        .iter()
        .map(|p| match p {
            DbValue::Null => Value::Null,
            DbValue::Integer(v) => Value::BigInt(*v),
            DbValue::Real(v) => Value::Double(*v),
            DbValue::Text(v) => Value::Text(v.clone()),
            DbValue::Boolean(v) => Value::Boolean(*v),
            DbValue::Timestamp(v) => Value::Timestamp(TimeUnit::Microsecond, v.timestamp_micros()),
        })
        .collect()
}

fn to_micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

/// Catalog rows only hold integers, text, booleans and timestamps; dates
/// come back as ISO text and anything exotic as its debug rendering.
fn read_value(row: &duckdb::Row, index: usize) -> Result<DbValue, duckdb::Error> {
    let value = match row.get_ref(index)? {
        ValueRef::Null => DbValue::Null,
        ValueRef::Boolean(v) => DbValue::Boolean(v),
        ValueRef::TinyInt(v) => DbValue::Integer(v.into()),
        ValueRef::SmallInt(v) => DbValue::Integer(v.into()),
        ValueRef::Int(v) => DbValue::Integer(v.into()),
        ValueRef::BigInt(v) => DbValue::Integer(v),
        ValueRef::UTinyInt(v) => DbValue::Integer(v.into()),
        ValueRef::USmallInt(v) => DbValue::Integer(v.into()),
        ValueRef::UInt(v) => DbValue::Integer(v.into()),
        ValueRef::HugeInt(v) => DbValue::Integer(v as i64),
        ValueRef::UBigInt(v) => DbValue::Integer(v as i64),
        ValueRef::Float(v) => DbValue::Real(v.into()),
        ValueRef::Double(v) => DbValue::Real(v),
        ValueRef::Text(bytes) => DbValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Timestamp(unit, v) => {
            let micros = to_micros(unit, v);
            DateTime::from_timestamp_micros(micros)
                .map_or(DbValue::Integer(micros), DbValue::Timestamp)
        }
        ValueRef::Date32(days) => DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map_or(DbValue::Integer(days.into()), |dt| {
                DbValue::Text(dt.format("%Y-%m-%d").to_string())
            }),
        other => {
            tracing::warn!(column = index, "unmapped DuckDB value, storing debug text");
            DbValue::Text(format!("{:?}", other))
        }
    };
    Ok(value)
}

/// Quote a single SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

/// Stable 64-bit FNV-1a digest of the statement text, for log correlation.
pub(crate) fn hash_sql(sql: &str) -> String {
    let hash = sql
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        });
    format!("{:016x}", hash)
}
