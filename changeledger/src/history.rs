//! The ledger of applied change-sets, stored inside the target database.

use crate::connection::{
    create_table_if_missing, integer_at, optional_text_at, text_at, Connection, Row, Value,
};
use crate::core::{ChangeSet, Identity};
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub(crate) const DEFAULT_LEDGER_TABLE_NAME: &str = "changeledger_history";

const COLUMNS: &str = "author, id, source_label, checksum, applied_at, sequence_no, duration_ms, outcome, description, deployment_id";

/// How a ledger row came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The change-set's operations ran and committed.
    Executed,
    /// An already-applied change-set ran again (`run_always` / `run_on_change`).
    Reran,
    /// A precondition did not hold under the `mark_ran` policy; nothing was executed.
    MarkRan,
    /// The operations failed and were rolled back, but the change-set does not fail the
    /// run (`fail_on_error: false`).
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Executed => "executed",
            Outcome::Reran => "reran",
            Outcome::MarkRan => "mark_ran",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "executed" => Ok(Outcome::Executed),
            "reran" => Ok(Outcome::Reran),
            "mark_ran" => Ok(Outcome::MarkRan),
            "failed" => Ok(Outcome::Failed),
            other => Err(Error::Generic(format!("unknown ledger outcome '{}'", other))),
        }
    }
}

/// One ledger row: a change-set that has been applied to the database.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRecord {
    pub identity: Identity,
    /// The checksum of the change-set at the time it was applied.
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    /// Position in application order, unique and increasing.
    pub sequence_no: i64,
    pub duration: Duration,
    pub outcome: Outcome,
    pub description: Option<String>,
    /// Shared by every row written during one `migrate` run.
    pub deployment_id: String,
}

/// The ledger state of a single change-set.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedState {
    NotApplied,
    Applied(AppliedRecord),
    /// Applied, but the stored checksum differs from the current content.
    Drifted(AppliedRecord),
}

/// Reads and writes the ledger table.
///
/// Every method takes the connection explicitly. Writes issued through a
/// [Transaction](crate::Transaction) commit or roll back with it.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    table_name: String,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TABLE_NAME)
    }
}

impl HistoryStore {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Create the ledger table if it does not exist.
    ///
    /// Uses `CREATE TABLE IF NOT EXISTS`, and a creation lost to a concurrent caller
    /// counts as success.
    pub fn ensure_schema(&self, conn: &mut dyn Connection) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::debug!(table = %self.table_name, "Ensuring ledger table exists");

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                author TEXT NOT NULL,
                id TEXT NOT NULL,
                source_label TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                sequence_no BIGINT NOT NULL,
                duration_ms BIGINT NOT NULL,
                outcome TEXT NOT NULL,
                description TEXT,
                deployment_id TEXT NOT NULL,
                PRIMARY KEY (author, id, source_label)
            )",
            self.table_name
        );
        create_table_if_missing(conn, &self.table_name, &ddl)
            .map_err(|e| Error::persistence(format!("create ledger table {}", self.table_name), e))
    }

    /// Whether the ledger table exists. Never writes.
    pub fn exists(&self, conn: &mut dyn Connection) -> Result<bool> {
        conn.table_exists(&self.table_name)
    }

    /// Look up the ledger row for an identity.
    pub fn find(
        &self,
        conn: &mut dyn Connection,
        identity: &Identity,
    ) -> Result<Option<AppliedRecord>> {
        let dialect = conn.dialect();
        let rows = conn.query_rows(
            &format!(
                "SELECT {} FROM {} WHERE author = {} AND id = {} AND source_label = {}",
                COLUMNS,
                self.table_name,
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3)
            ),
            &identity_params(identity),
        )?;
        rows.first().map(decode_record).transpose()
    }

    /// Three-way ledger state of a change-set, comparing checksums.
    pub fn applied_state(
        &self,
        conn: &mut dyn Connection,
        change_set: &ChangeSet,
    ) -> Result<AppliedState> {
        Ok(match self.find(conn, change_set.identity())? {
            None => AppliedState::NotApplied,
            Some(record) if change_set.accepts_checksum(&record.checksum) => {
                AppliedState::Applied(record)
            }
            Some(record) => AppliedState::Drifted(record),
        })
    }

    /// Whether the change-set has been applied.
    ///
    /// A row whose checksum no longer matches is neither applied nor pending: it
    /// surfaces [Error::ChecksumMismatch].
    ///
    /// This is the single change-set lookup for callers outside the engine. Planning
    /// reads the whole ledger once through [HistoryStore::list_applied] instead.
    pub fn is_applied(&self, conn: &mut dyn Connection, change_set: &ChangeSet) -> Result<bool> {
        match self.applied_state(conn, change_set)? {
            AppliedState::NotApplied => Ok(false),
            AppliedState::Applied(_) => Ok(true),
            AppliedState::Drifted(record) => Err(Error::ChecksumMismatch {
                identity: record.identity,
                stored: record.checksum,
                current: change_set.checksum().to_string(),
            }),
        }
    }

    /// Write a ledger row, replacing an existing row for the same identity (re-runs).
    ///
    /// Call this on the change-set's [Transaction](crate::Transaction) so the row and the
    /// change-set's effects commit together.
    pub fn record_applied(&self, conn: &mut dyn Connection, record: &AppliedRecord) -> Result<()> {
        let dialect = conn.dialect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})
             ON CONFLICT (author, id, source_label) DO UPDATE SET
                checksum = excluded.checksum,
                applied_at = excluded.applied_at,
                sequence_no = excluded.sequence_no,
                duration_ms = excluded.duration_ms,
                outcome = excluded.outcome,
                description = excluded.description,
                deployment_id = excluded.deployment_id",
            self.table_name,
            COLUMNS,
            dialect.placeholders(10)
        );
        let params = [
            Value::from(record.identity.author.as_str()),
            Value::from(record.identity.id.as_str()),
            Value::from(record.identity.source_label.as_str()),
            Value::from(record.checksum.as_str()),
            Value::from(format_timestamp(&record.applied_at)),
            Value::Integer(record.sequence_no),
            Value::Integer(record.duration.as_millis() as i64),
            Value::from(record.outcome.as_str()),
            Value::from(record.description.clone()),
            Value::from(record.deployment_id.as_str()),
        ];
        conn.execute_params(&sql, &params)
            .map(|_| ())
            .map_err(|e| {
                Error::persistence(format!("record change-set {} in ledger", record.identity), e)
            })
    }

    /// Every ledger row, ordered by sequence number ascending.
    pub fn list_applied(&self, conn: &mut dyn Connection) -> Result<Vec<AppliedRecord>> {
        let rows = conn.query_rows(
            &format!(
                "SELECT {} FROM {} ORDER BY sequence_no ASC",
                COLUMNS, self.table_name
            ),
            &[],
        )?;
        rows.iter().map(decode_record).collect()
    }

    /// The sequence number the next ledger row should use.
    pub fn next_sequence(&self, conn: &mut dyn Connection) -> Result<i64> {
        let rows = conn.query_rows(
            &format!(
                "SELECT COALESCE(MAX(sequence_no), 0) FROM {}",
                self.table_name
            ),
            &[],
        )?;
        let current = rows
            .first()
            .map(|row| integer_at(row, 0, "sequence_no"))
            .transpose()?
            .unwrap_or(0);
        Ok(current + 1)
    }

    /// Delete the ledger row for an identity. Only explicit rollback calls this.
    pub fn remove(&self, conn: &mut dyn Connection, identity: &Identity) -> Result<bool> {
        let dialect = conn.dialect();
        let affected = conn
            .execute_params(
                &format!(
                    "DELETE FROM {} WHERE author = {} AND id = {} AND source_label = {}",
                    self.table_name,
                    dialect.placeholder(1),
                    dialect.placeholder(2),
                    dialect.placeholder(3)
                ),
                &identity_params(identity),
            )
            .map_err(|e| {
                Error::persistence(format!("remove change-set {} from ledger", identity), e)
            })?;
        Ok(affected > 0)
    }
}

fn identity_params(identity: &Identity) -> [Value; 3] {
    [
        Value::from(identity.author.as_str()),
        Value::from(identity.id.as_str()),
        Value::from(identity.source_label.as_str()),
    ]
}

pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::Generic(format!("Failed to parse datetime '{}': {}", raw, e)))
}

fn decode_record(row: &Row) -> Result<AppliedRecord> {
    let duration_ms = integer_at(row, 6, "duration_ms")?;
    Ok(AppliedRecord {
        identity: Identity::new(
            text_at(row, 0, "author")?,
            text_at(row, 1, "id")?,
            text_at(row, 2, "source_label")?,
        ),
        checksum: text_at(row, 3, "checksum")?,
        applied_at: parse_timestamp(&text_at(row, 4, "applied_at")?)?,
        sequence_no: integer_at(row, 5, "sequence_no")?,
        duration: Duration::from_millis(duration_ms.max(0) as u64),
        outcome: text_at(row, 7, "outcome")?.parse()?,
        description: optional_text_at(row, 8, "description")?,
        deployment_id: text_at(row, 9, "deployment_id")?,
    })
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use rusqlite::Connection as SqliteConnection;

    fn record(id: &str, sequence_no: i64, checksum: &str) -> AppliedRecord {
        AppliedRecord {
            identity: Identity::new("alice", id, "master.yaml"),
            checksum: checksum.to_string(),
            applied_at: Utc::now(),
            sequence_no,
            duration: Duration::from_millis(12),
            outcome: Outcome::Executed,
            description: None,
            deployment_id: "d1".to_string(),
        }
    }

    fn change_set(id: &str, sql: &str) -> ChangeSet {
        ChangeSet::builder("alice", id)
            .source_label("master.yaml")
            .sql(sql)
            .build()
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = HistoryStore::default();
        assert!(!store.exists(&mut conn).unwrap());
        store.ensure_schema(&mut conn).unwrap();
        store.ensure_schema(&mut conn).unwrap();
        assert!(store.exists(&mut conn).unwrap());
    }

    #[test]
    fn record_and_list_in_sequence_order() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = HistoryStore::new("custom_ledger");
        store.ensure_schema(&mut conn).unwrap();

        store.record_applied(&mut conn, &record("b", 2, "x")).unwrap();
        store.record_applied(&mut conn, &record("a", 1, "y")).unwrap();

        let listed = store.list_applied(&mut conn).unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.identity.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(listed[0].duration, Duration::from_millis(12));
        assert_eq!(listed[0].outcome, Outcome::Executed);
        assert_eq!(store.next_sequence(&mut conn).unwrap(), 3);
    }

    #[test]
    fn timestamps_survive_the_round_trip() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = HistoryStore::default();
        store.ensure_schema(&mut conn).unwrap();
        let written = record("a", 1, "x");
        store.record_applied(&mut conn, &written).unwrap();

        let read = store
            .find(&mut conn, &written.identity)
            .unwrap()
            .unwrap();
        let drift = (read.applied_at - written.applied_at).num_microseconds().unwrap();
        assert_eq!(drift, 0);
    }

    #[test]
    fn record_applied_replaces_existing_row() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = HistoryStore::default();
        store.ensure_schema(&mut conn).unwrap();
        store.record_applied(&mut conn, &record("a", 1, "old")).unwrap();

        let mut rerun = record("a", 2, "new");
        rerun.outcome = Outcome::Reran;
        store.record_applied(&mut conn, &rerun).unwrap();

        let listed = store.list_applied(&mut conn).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checksum, "new");
        assert_eq!(listed[0].outcome, Outcome::Reran);
        assert_eq!(listed[0].sequence_no, 2);
    }

    #[test]
    fn is_applied_distinguishes_pending_applied_and_drifted() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = HistoryStore::default();
        store.ensure_schema(&mut conn).unwrap();

        let cs = change_set("a", "CREATE TABLE a (id INTEGER)");
        assert!(!store.is_applied(&mut conn, &cs).unwrap());

        store
            .record_applied(&mut conn, &record("a", 1, cs.checksum()))
            .unwrap();
        assert!(store.is_applied(&mut conn, &cs).unwrap());

        let edited = change_set("a", "CREATE TABLE a (id INTEGER, name TEXT)");
        match store.is_applied(&mut conn, &edited) {
            Err(Error::ChecksumMismatch {
                identity,
                stored,
                current,
            }) => {
                assert_eq!(identity, *cs.identity());
                assert_eq!(stored, cs.checksum());
                assert_eq!(current, edited.checksum());
            }
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn remove_deletes_only_the_given_identity() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = HistoryStore::default();
        store.ensure_schema(&mut conn).unwrap();
        store.record_applied(&mut conn, &record("a", 1, "x")).unwrap();
        store.record_applied(&mut conn, &record("b", 2, "y")).unwrap();

        assert!(store
            .remove(&mut conn, &Identity::new("alice", "a", "master.yaml"))
            .unwrap());
        assert!(!store
            .remove(&mut conn, &Identity::new("alice", "a", "master.yaml"))
            .unwrap());
        assert_eq!(store.list_applied(&mut conn).unwrap().len(), 1);
    }

    #[test]
    fn write_failure_is_a_persistence_error() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let store = HistoryStore::default();
        // no ensure_schema: the table is missing
        let err = store
            .record_applied(&mut conn, &record("a", 1, "x"))
            .unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }), "{:?}", err);
    }

    #[test]
    fn unknown_outcome_is_rejected() {
        assert!("bogus".parse::<Outcome>().is_err());
        assert_eq!("mark_ran".parse::<Outcome>().unwrap(), Outcome::MarkRan);
    }
}
