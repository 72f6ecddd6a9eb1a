//! The database interface the engine consumes.
//!
//! The engine never opens connections itself. Callers hand it a live connection as a
//! `&mut dyn Connection`, and every component receives that handle explicitly for the
//! duration of a call. Implementations are provided for
//! [`rusqlite::Connection`](crate::sqlite) (feature `sqlite`) and
//! [`postgres::Client`](crate::postgres) (feature `postgres`).

use crate::error::{Error, Result};
use std::fmt;

/// SQL dialect of a connection; decides placeholder syntax and catalog queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// The positional placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", index),
            Dialect::Postgres => format!("${}", index),
        }
    }

    /// The statement that opens a transaction. SQLite takes the write lock up front so
    /// that concurrent writers wait on the busy timeout instead of failing on upgrade.
    pub fn begin_statement(self) -> &'static str {
        match self {
            Dialect::Sqlite => "BEGIN IMMEDIATE",
            Dialect::Postgres => "BEGIN",
        }
    }

    /// A comma-separated list of placeholders `1..=count`.
    pub fn placeholders(self, count: usize) -> String {
        (1..=count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A single SQL value passed as a parameter or read back from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        value.map(Value::Text).unwrap_or(Value::Null)
    }
}

/// A result row, one [Value] per selected column.
pub type Row = Vec<Value>;

/// A live connection to the target database.
///
/// Implementations must run every call on the same underlying session, so that
/// statements issued between `BEGIN` and `COMMIT` belong to one transaction.
pub trait Connection {
    fn dialect(&self) -> Dialect;

    /// Execute one or more raw statements without parameters.
    fn batch(&mut self, sql: &str) -> Result<()>;

    /// Execute a single statement with positional parameters, returning the number of
    /// affected rows.
    fn execute_params(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run a query with positional parameters and collect every row.
    fn query_rows(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Whether a table with this name exists in the connection's default schema.
    fn table_exists(&mut self, table: &str) -> Result<bool>;
}

/// A transaction on a borrowed [Connection].
///
/// The transaction rolls back when dropped unless [Transaction::commit] was called, so
/// every early return leaves the database untouched. It implements [Connection] itself,
/// which lets the ledger write share the transaction with the change-set's statements.
pub struct Transaction<'c> {
    conn: &'c mut dyn Connection,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub fn begin(conn: &'c mut dyn Connection) -> Result<Self> {
        let begin = conn.dialect().begin_statement();
        conn.batch(begin)?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    /// Commit the transaction. A failed `COMMIT` can leave the session inside the
    /// transaction (SQLite keeps it open on deferred constraint errors), so it is rolled
    /// back before the commit error is returned.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        if let Err(error) = self.conn.batch("COMMIT") {
            if let Err(_rollback_error) = self.conn.batch("ROLLBACK") {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_rollback_error, "Rollback after failed commit failed");
            }
            return Err(error);
        }
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.batch("ROLLBACK")
    }
}

impl Connection for Transaction<'_> {
    fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    fn batch(&mut self, sql: &str) -> Result<()> {
        self.conn.batch(sql)
    }

    fn execute_params(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.conn.execute_params(sql, params)
    }

    fn query_rows(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.conn.query_rows(sql, params)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool> {
        self.conn.table_exists(table)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(_error) = self.conn.batch("ROLLBACK") {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_error, "Rollback of abandoned transaction failed");
            }
        }
    }
}

/// Run a `CREATE TABLE IF NOT EXISTS` statement for `table`, tolerating a concurrent
/// creator.
///
/// On PostgreSQL two sessions can both pass the `IF NOT EXISTS` check, and the slower one
/// fails with a catalog unique violation. If the table exists once the statement failed,
/// another session created it and the call succeeds.
pub(crate) fn create_table_if_missing(
    conn: &mut dyn Connection,
    table: &str,
    ddl: &str,
) -> Result<()> {
    match conn.batch(ddl) {
        Ok(()) => Ok(()),
        Err(error) => {
            if conn.table_exists(table)? {
                #[cfg(feature = "tracing")]
                tracing::debug!(table, error = %error, "Table was created concurrently");
                Ok(())
            } else {
                Err(error)
            }
        }
    }
}

/// Read a non-null text column.
pub(crate) fn text_at(row: &Row, index: usize, column: &str) -> Result<String> {
    match row.get(index) {
        Some(Value::Text(v)) => Ok(v.clone()),
        other => Err(Error::Generic(format!(
            "expected text in column '{}', found {:?}",
            column, other
        ))),
    }
}

/// Read a nullable text column.
pub(crate) fn optional_text_at(row: &Row, index: usize, column: &str) -> Result<Option<String>> {
    match row.get(index) {
        Some(Value::Null) => Ok(None),
        _ => text_at(row, index, column).map(Some),
    }
}

/// Read a non-null integer column.
pub(crate) fn integer_at(row: &Row, index: usize, column: &str) -> Result<i64> {
    match row.get(index) {
        Some(Value::Integer(v)) => Ok(*v),
        other => Err(Error::Generic(format!(
            "expected integer in column '{}', found {:?}",
            column, other
        ))),
    }
}
