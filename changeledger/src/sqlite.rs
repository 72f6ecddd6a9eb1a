//! # SQLite support
//!
//! Implements [Connection] for [`rusqlite::Connection`].
//!
//! SQLite supports transactional DDL, so a failing transactional change-set leaves no
//! trace. When several processes migrate the same database file, set a busy timeout on
//! each connection so that a writer waits for the others instead of failing with
//! `SQLITE_BUSY`; [configure] does that.
//!
//! ```
//! use changeledger::{ChangeSet, Migrator, ProgrammaticSource};
//! use rusqlite::Connection;
//!
//! let source = ProgrammaticSource::new(
//!     "app",
//!     vec![
//!         ChangeSet::builder("alice", "create-users")
//!             .sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
//!             .build(),
//!         ChangeSet::builder("alice", "add-email")
//!             .sql("ALTER TABLE users ADD COLUMN email TEXT")
//!             .build(),
//!     ],
//! );
//! let migrator = Migrator::from_source(&source).unwrap();
//!
//! let mut conn = Connection::open_in_memory().unwrap();
//! let report = migrator.migrate(&mut conn).unwrap();
//! assert_eq!(report.applied, 2);
//!
//! // a second run finds nothing to do
//! assert!(migrator.status(&mut conn).unwrap().is_up_to_date());
//! ```

use crate::connection::{Connection, Dialect, Row, Value};
use crate::error::Result;
use rusqlite::types::{ToSqlOutput, ValueRef};
use std::time::Duration;

/// Default busy timeout applied by [configure].
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Set up a connection for safe concurrent access: concurrent writers wait up to
/// `busy_timeout` for each other instead of failing immediately.
pub fn configure(conn: &rusqlite::Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::from(*v),
            Value::Real(v) => ToSqlOutput::from(*v),
            Value::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) | ValueRef::Blob(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
    }
}

impl Connection for rusqlite::Connection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn batch(&mut self, sql: &str) -> Result<()> {
        self.execute_batch(sql)?;
        Ok(())
    }

    fn execute_params(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let affected =
            rusqlite::Connection::execute(self, sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(affected as u64)
    }

    fn query_rows(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut stmt = self.prepare(sql)?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                values.push(value_from_ref(row.get_ref(index)?));
            }
            collected.push(values);
        }
        Ok(collected)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let count: i64 = self.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
