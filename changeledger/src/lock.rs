//! A database-backed mutual-exclusion lock that serializes apply runs across processes.
//!
//! The lock is a single row (`id = 1`) in its own table. Acquiring inserts the row with
//! `ON CONFLICT DO NOTHING`, so at most one owner can succeed. The owner refreshes
//! `heartbeat_at` while it works; a row whose heartbeat is older than the staleness
//! window belongs to a crashed process and may be reclaimed by the next caller.

use crate::cancel::CancellationToken;
use crate::connection::{create_table_if_missing, text_at, Connection, Value};
use crate::error::{Error, Result};
use crate::history::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_LOCK_TABLE_NAME: &str = "changeledger_lock";

const LOCK_ROW_ID: i64 = 1;
const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Timing parameters of the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// A lock whose heartbeat is older than this is considered abandoned.
    pub staleness: Duration,
    /// First wait between acquisition attempts; doubled after every failed attempt.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(10 * 60),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// The lock row as currently stored.
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LockInfo {
    /// Whether the owner has not heartbeated within `staleness` as of `now`.
    pub fn is_stale(&self, staleness: Duration, now: DateTime<Utc>) -> bool {
        (now - self.heartbeat_at)
            .to_std()
            .map(|silent_for| silent_for > staleness)
            .unwrap_or(false)
    }
}

/// Proof of lock ownership, returned by [LockManager::acquire].
#[derive(Debug, Clone, PartialEq)]
pub struct LockHandle {
    owner_id: String,
    acquired_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

enum Attempt {
    Acquired(LockHandle),
    Held(LockInfo),
    /// The row vanished between the insert and the read; try again at once.
    Raced,
}

/// Acquires, refreshes and releases the migration lock.
#[derive(Debug, Clone)]
pub struct LockManager {
    table_name: String,
    owner_id: String,
    settings: LockSettings,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TABLE_NAME)
    }
}

impl LockManager {
    /// Create a lock manager with a fresh owner id unique to this instance.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            owner_id: generate_owner_id(),
            settings: LockSettings::default(),
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_settings(mut self, settings: LockSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Create the lock table if it does not exist. Safe to call from several instances
    /// at once.
    pub fn ensure_schema(&self, conn: &mut dyn Connection) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGINT PRIMARY KEY,
                locked INTEGER NOT NULL,
                owner_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL
            )",
            self.table_name
        );
        create_table_if_missing(conn, &self.table_name, &ddl)
            .map_err(|e| Error::persistence(format!("create lock table {}", self.table_name), e))
    }

    /// Wait for the lock, polling with exponential backoff until `timeout` elapses.
    ///
    /// Fails with [Error::LockTimeout] naming the holder, or [Error::Cancelled] once the
    /// token is cancelled. If this manager's owner id already holds the row, the existing
    /// lock is reused.
    pub fn acquire(
        &self,
        conn: &mut dyn Connection,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut backoff = self.settings.initial_backoff;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let holder = match self.try_acquire(conn)? {
                Attempt::Acquired(handle) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        owner_id = %handle.owner_id,
                        waited_ms = started.elapsed().as_millis(),
                        "Acquired migration lock"
                    );
                    return Ok(handle);
                }
                Attempt::Raced => continue,
                Attempt::Held(info) => info,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    waited: started.elapsed(),
                    holder: holder.owner_id,
                });
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(
                holder = %holder.owner_id,
                backoff_ms = backoff.as_millis(),
                "Migration lock is held, waiting"
            );

            sleep_cancellable(backoff.min(deadline - now), cancel);
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }
    }

    fn try_acquire(&self, conn: &mut dyn Connection) -> Result<Attempt> {
        let now = Utc::now();
        if self.insert_lock_row(conn, now)? {
            return Ok(Attempt::Acquired(LockHandle {
                owner_id: self.owner_id.clone(),
                acquired_at: now,
            }));
        }

        let Some(info) = self.current(conn)? else {
            return Ok(Attempt::Raced);
        };

        if info.owner_id == self.owner_id {
            self.touch(conn, now)?;
            return Ok(Attempt::Acquired(LockHandle {
                owner_id: self.owner_id.clone(),
                acquired_at: info.acquired_at,
            }));
        }

        if info.is_stale(self.settings.staleness, now) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                holder = %info.owner_id,
                heartbeat_at = %info.heartbeat_at,
                "Reclaiming stale migration lock"
            );

            // only delete the row we just read; a refreshed heartbeat means the holder is alive
            let dialect = conn.dialect();
            conn.execute_params(
                &format!(
                    "DELETE FROM {} WHERE id = {} AND owner_id = {} AND heartbeat_at = {}",
                    self.table_name,
                    dialect.placeholder(1),
                    dialect.placeholder(2),
                    dialect.placeholder(3)
                ),
                &[
                    Value::Integer(LOCK_ROW_ID),
                    Value::from(info.owner_id.as_str()),
                    Value::from(format_timestamp(&info.heartbeat_at)),
                ],
            )
            .map_err(|e| Error::persistence("reclaim stale migration lock", e))?;

            if self.insert_lock_row(conn, now)? {
                return Ok(Attempt::Acquired(LockHandle {
                    owner_id: self.owner_id.clone(),
                    acquired_at: now,
                }));
            }
            return Ok(match self.current(conn)? {
                Some(info) => Attempt::Held(info),
                None => Attempt::Raced,
            });
        }

        Ok(Attempt::Held(info))
    }

    fn insert_lock_row(&self, conn: &mut dyn Connection, now: DateTime<Utc>) -> Result<bool> {
        let dialect = conn.dialect();
        let timestamp = format_timestamp(&now);
        let inserted = conn
            .execute_params(
                &format!(
                    "INSERT INTO {} (id, locked, owner_id, acquired_at, heartbeat_at) VALUES ({}, 1, {}, {}, {})
                     ON CONFLICT (id) DO NOTHING",
                    self.table_name,
                    dialect.placeholder(1),
                    dialect.placeholder(2),
                    dialect.placeholder(3),
                    dialect.placeholder(4)
                ),
                &[
                    Value::Integer(LOCK_ROW_ID),
                    Value::from(self.owner_id.as_str()),
                    Value::from(timestamp.as_str()),
                    Value::from(timestamp.as_str()),
                ],
            )
            .map_err(|e| Error::persistence("insert migration lock", e))?;
        Ok(inserted == 1)
    }

    fn touch(&self, conn: &mut dyn Connection, now: DateTime<Utc>) -> Result<u64> {
        let dialect = conn.dialect();
        conn.execute_params(
            &format!(
                "UPDATE {} SET heartbeat_at = {} WHERE id = {} AND owner_id = {}",
                self.table_name,
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3)
            ),
            &[
                Value::from(format_timestamp(&now)),
                Value::Integer(LOCK_ROW_ID),
                Value::from(self.owner_id.as_str()),
            ],
        )
        .map_err(|e| Error::persistence("refresh migration lock heartbeat", e))
    }

    /// Refresh the heartbeat of a held lock.
    ///
    /// Fails with [Error::LockLost] when the row is gone or now belongs to someone else,
    /// e.g. after an operator forced a release or another process reclaimed it as stale.
    pub fn heartbeat(&self, conn: &mut dyn Connection, handle: &LockHandle) -> Result<()> {
        if handle.owner_id != self.owner_id || self.touch(conn, Utc::now())? == 0 {
            return Err(Error::LockLost {
                owner: handle.owner_id.clone(),
            });
        }
        Ok(())
    }

    /// Release a held lock. Releasing twice, or after the lock was lost, is not an error.
    pub fn release(&self, conn: &mut dyn Connection, handle: &LockHandle) -> Result<()> {
        let dialect = conn.dialect();
        let removed = conn
            .execute_params(
                &format!(
                    "DELETE FROM {} WHERE id = {} AND owner_id = {}",
                    self.table_name,
                    dialect.placeholder(1),
                    dialect.placeholder(2)
                ),
                &[
                    Value::Integer(LOCK_ROW_ID),
                    Value::from(handle.owner_id.as_str()),
                ],
            )
            .map_err(|e| Error::persistence("release migration lock", e))?;

        if removed > 0 {
            #[cfg(feature = "tracing")]
            tracing::info!(owner_id = %handle.owner_id, "Released migration lock");
        }

        Ok(())
    }

    /// Delete the lock row whoever holds it. Returns whether a row was removed.
    ///
    /// Meant for operators recovering from a crashed run; a live holder will fail its
    /// next heartbeat with [Error::LockLost].
    pub fn force_release(&self, conn: &mut dyn Connection) -> Result<bool> {
        if !conn.table_exists(&self.table_name)? {
            return Ok(false);
        }
        let removed = conn
            .execute_params(&format!("DELETE FROM {}", self.table_name), &[])
            .map_err(|e| Error::persistence("force release migration lock", e))?;

        #[cfg(feature = "tracing")]
        tracing::warn!(removed, "Forcibly released migration lock");

        Ok(removed > 0)
    }

    /// The current lock row, if any. Never writes.
    pub fn current(&self, conn: &mut dyn Connection) -> Result<Option<LockInfo>> {
        if !conn.table_exists(&self.table_name)? {
            return Ok(None);
        }
        let dialect = conn.dialect();
        let rows = conn.query_rows(
            &format!(
                "SELECT owner_id, acquired_at, heartbeat_at FROM {} WHERE id = {}",
                self.table_name,
                dialect.placeholder(1)
            ),
            &[Value::Integer(LOCK_ROW_ID)],
        )?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(LockInfo {
            owner_id: text_at(row, 0, "owner_id")?,
            acquired_at: parse_timestamp(&text_at(row, 1, "acquired_at")?)?,
            heartbeat_at: parse_timestamp(&text_at(row, 2, "heartbeat_at")?)?,
        }))
    }
}

fn generate_owner_id() -> String {
    format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}

fn sleep_cancellable(total: Duration, cancel: &CancellationToken) {
    let until = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= until || cancel.is_cancelled() {
            return;
        }
        thread::sleep((until - now).min(SLEEP_SLICE));
    }
}
