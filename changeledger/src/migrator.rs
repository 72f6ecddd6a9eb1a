use crate::cancel::CancellationToken;
use crate::config::{check_table_name, EngineConfig};
use crate::connection::Connection;
use crate::core::{ChangeSet, Identity};
use crate::error::{Error, Result};
use crate::executor::{
    new_deployment_id, ExecutionContext, ExecutionReport, Executor, Hooks, RollbackReport,
};
use crate::history::{AppliedRecord, HistoryStore};
use crate::lock::{LockHandle, LockInfo, LockManager, LockSettings};
use crate::planner::{MigrationPlan, Planner};
use crate::registry::Registry;
use crate::source::DescriptorSource;
use std::time::Duration;

/// A change-set whose applied checksum no longer matches its content.
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub identity: Identity,
    pub stored: String,
    pub current: String,
}

/// Result of [Migrator::validate].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub change_sets: usize,
    /// Change-sets not yet in the ledger.
    pub pending: usize,
    pub drifted: Vec<Drift>,
    /// Ledger rows with no change-set in the registry.
    pub unexpected: Vec<AppliedRecord>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.drifted.is_empty()
    }

    /// Convert the first drift into [Error::ChecksumMismatch].
    pub fn into_result(self) -> Result<Self> {
        match self.drifted.first() {
            Some(drift) => Err(Error::ChecksumMismatch {
                identity: drift.identity.clone(),
                stored: drift.stored.clone(),
                current: drift.current.clone(),
            }),
            None => Ok(self),
        }
    }
}

/// The entry point: owns the registry and settings, and runs every engine operation.
///
/// Mutating operations (`migrate`, `rollback`) run under the migration lock; `status`,
/// `history` and `validate` never write.
///
/// ```
/// use changeledger::{EmbeddedSource, Migrator};
///
/// let source = EmbeddedSource::new(
///     "app.yaml",
///     r#"
/// changelog:
///   - change_set:
///       id: create-users
///       author: alice
///       sql: CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)
///       rollback: DROP TABLE users
/// "#,
/// );
/// let migrator = Migrator::from_source(&source)
///     .unwrap()
///     .with_ledger_table_name("app_ledger")
///     .unwrap()
///     .on_change_set_complete(|identity, duration| {
///         println!("applied {} in {:?}", identity, duration);
///     });
///
/// let mut conn = rusqlite::Connection::open_in_memory().unwrap();
/// assert_eq!(migrator.status(&mut conn).unwrap().len(), 1);
///
/// migrator.migrate(&mut conn).unwrap();
/// assert_eq!(migrator.history(&mut conn).unwrap().len(), 1);
///
/// migrator.rollback(&mut conn, 1).unwrap();
/// assert!(migrator.history(&mut conn).unwrap().is_empty());
/// ```
#[derive(Debug)]
pub struct Migrator {
    registry: Registry,
    history: HistoryStore,
    lock: LockManager,
    lock_timeout: Duration,
    max_duration: Option<Duration>,
    accept_drift: bool,
    contexts: Vec<String>,
    hooks: Hooks,
}

impl Migrator {
    pub fn new(registry: Registry) -> Self {
        let config = EngineConfig::default();
        Self {
            registry,
            history: HistoryStore::new(config.ledger_table.clone()),
            lock: LockManager::new(config.lock_table.clone()).with_settings(config.lock_settings()),
            lock_timeout: config.lock_timeout(),
            max_duration: config.max_duration(),
            accept_drift: config.accept_drift,
            contexts: config.contexts,
            hooks: Hooks::default(),
        }
    }

    /// Load a registry from a descriptor source.
    pub fn from_source(source: &dyn DescriptorSource) -> Result<Self> {
        Ok(Self::new(Registry::load(source)?))
    }

    /// Build from change-sets defined in code.
    pub fn from_change_sets(change_sets: Vec<ChangeSet>) -> Result<Self> {
        Ok(Self::new(Registry::from_change_sets(change_sets)?))
    }

    /// Apply every setting of an [EngineConfig].
    ///
    /// Fails with [Error::Config] when a table name is not a plain SQL identifier.
    pub fn with_config(self, config: &EngineConfig) -> Result<Self> {
        let migrator = self
            .with_ledger_table_name(config.ledger_table.clone())?
            .with_lock_table_name(config.lock_table.clone())?
            .with_lock_timeout(config.lock_timeout())
            .with_lock_settings(config.lock_settings())
            .with_accept_drift(config.accept_drift)
            .with_contexts(config.contexts.clone());
        let migrator = match config.max_duration() {
            Some(limit) => migrator.with_max_duration(limit),
            None => migrator,
        };
        Ok(match &config.owner_id {
            Some(owner_id) => migrator.with_owner_id(owner_id.clone()),
            None => migrator,
        })
    }

    /// Set a custom name for the ledger table. Defaults to `changeledger_history`.
    ///
    /// The name is interpolated into SQL, so it must match `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn with_ledger_table_name(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        check_table_name("ledger_table", &name)?;
        self.history = HistoryStore::new(name);
        Ok(self)
    }

    /// Set a custom name for the lock table. Defaults to `changeledger_lock`.
    pub fn with_lock_table_name(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        check_table_name("lock_table", &name)?;
        self.lock = LockManager::new(name)
            .with_owner_id(self.lock.owner_id().to_string())
            .with_settings(*self.lock.settings());
        Ok(self)
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.lock = self.lock.with_owner_id(owner_id);
        self
    }

    /// How long to wait for another instance's lock. Defaults to five minutes.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock = self.lock.with_settings(settings);
        self
    }

    /// Limit the duration of a `migrate` or `rollback` run.
    pub fn with_max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    /// Treat checksum drift as applied instead of failing.
    pub fn with_accept_drift(mut self, accept_drift: bool) -> Self {
        self.accept_drift = accept_drift;
        self
    }

    pub fn with_contexts(mut self, contexts: Vec<String>) -> Self {
        self.contexts = contexts;
        self
    }

    /// Set a callback to be invoked when a change-set starts.
    pub fn on_change_set_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Identity) + Send + Sync + 'static,
    {
        self.hooks.on_change_set_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a change-set commits.
    pub fn on_change_set_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Identity, Duration) + Send + Sync + 'static,
    {
        self.hooks.on_change_set_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a change-set is marked as ran because a
    /// precondition did not hold.
    pub fn on_change_set_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Identity) + Send + Sync + 'static,
    {
        self.hooks.on_change_set_skipped = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a change-set fails.
    pub fn on_change_set_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Identity, &Error) + Send + Sync + 'static,
    {
        self.hooks.on_change_set_error = Some(Box::new(callback));
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ledger_table_name(&self) -> &str {
        self.history.table_name()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock
    }

    fn planner(&self) -> Planner {
        Planner::new()
            .with_accept_drift(self.accept_drift)
            .with_contexts(self.contexts.clone())
    }

    /// The change-sets `migrate` would apply. Never writes to the database.
    pub fn status(&self, conn: &mut dyn Connection) -> Result<MigrationPlan<'_>> {
        self.planner().plan(&self.registry, &self.history, conn)
    }

    /// Apply every pending change-set under the migration lock.
    pub fn migrate(&self, conn: &mut dyn Connection) -> Result<ExecutionReport> {
        self.migrate_with(conn, &CancellationToken::new())
    }

    /// [Migrator::migrate] with a token that can cancel lock acquisition and the run.
    pub fn migrate_with(
        &self,
        conn: &mut dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("migrate", ledger = %self.history.table_name()).entered();

        self.with_lock(conn, cancel, |migrator, conn, handle| {
            migrator.history.ensure_schema(conn)?;
            let plan = migrator.planner().plan(&migrator.registry, &migrator.history, conn)?;

            if plan.is_up_to_date() {
                #[cfg(feature = "tracing")]
                tracing::info!("Database is up to date");
            } else {
                #[cfg(feature = "tracing")]
                tracing::info!(pending = plan.len(), "Applying change-sets");
            }

            let mut ctx = migrator.context(conn, cancel, handle);
            Executor::new(&migrator.history, &migrator.hooks).execute(&plan, &mut ctx)
        })
    }

    /// The ledger, oldest first. Empty when the ledger table does not exist.
    pub fn history(&self, conn: &mut dyn Connection) -> Result<Vec<AppliedRecord>> {
        if !self.history.exists(conn)? {
            return Ok(Vec::new());
        }
        self.history.list_applied(conn)
    }

    /// Undo the `count` most recently applied change-sets under the migration lock.
    pub fn rollback(&self, conn: &mut dyn Connection, count: usize) -> Result<RollbackReport> {
        self.rollback_with(conn, count, &CancellationToken::new())
    }

    pub fn rollback_with(
        &self,
        conn: &mut dyn Connection,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<RollbackReport> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("rollback", count).entered();

        self.with_lock(conn, cancel, |migrator, conn, handle| {
            let mut ctx = migrator.context(conn, cancel, handle);
            Executor::new(&migrator.history, &migrator.hooks).roll_back(
                &migrator.registry,
                count,
                &mut ctx,
            )
        })
    }

    /// Forcibly remove the migration lock, whoever holds it.
    pub fn release_locks(&self, conn: &mut dyn Connection) -> Result<bool> {
        self.lock.force_release(conn)
    }

    /// The current holder of the migration lock, if any.
    pub fn lock_status(&self, conn: &mut dyn Connection) -> Result<Option<LockInfo>> {
        self.lock.current(conn)
    }

    /// Compare the registry with the ledger without applying anything.
    ///
    /// Drift on `run_on_change` change-sets and on accepted checksums is not reported.
    pub fn validate(&self, conn: &mut dyn Connection) -> Result<ValidationReport> {
        let mut applied = self.history(conn)?;
        let mut pending = 0;
        let mut drifted = Vec::new();

        for change_set in self.registry.iter() {
            let position = applied
                .iter()
                .position(|record| &record.identity == change_set.identity());
            match position.map(|index| applied.swap_remove(index)) {
                None => {
                    if change_set.matches_contexts(&self.contexts) {
                        pending += 1;
                    }
                }
                Some(record) => {
                    if !change_set.accepts_checksum(&record.checksum) && !change_set.run_on_change()
                    {
                        drifted.push(Drift {
                            identity: record.identity,
                            stored: record.checksum,
                            current: change_set.checksum().to_string(),
                        });
                    }
                }
            }
        }
        applied.sort_by_key(|record| record.sequence_no);

        Ok(ValidationReport {
            change_sets: self.registry.len(),
            pending,
            drifted,
            unexpected: applied,
        })
    }

    fn context<'a>(
        &'a self,
        conn: &'a mut dyn Connection,
        cancel: &'a CancellationToken,
        handle: &'a LockHandle,
    ) -> ExecutionContext<'a> {
        let ctx = ExecutionContext::new(conn, cancel)
            .with_lock(&self.lock, handle)
            .with_deployment_id(new_deployment_id());
        match self.max_duration {
            Some(limit) => ctx.with_max_duration(limit),
            None => ctx,
        }
    }

    /// Run `f` while holding the migration lock, releasing it on every path.
    ///
    /// An error from `f` wins over an error releasing the lock.
    fn with_lock<T>(
        &self,
        conn: &mut dyn Connection,
        cancel: &CancellationToken,
        f: impl FnOnce(&Self, &mut dyn Connection, &LockHandle) -> Result<T>,
    ) -> Result<T> {
        self.lock.ensure_schema(conn)?;
        let handle = self.lock.acquire(conn, self.lock_timeout, cancel)?;

        let result = f(self, &mut *conn, &handle);
        let released = self.lock.release(conn, &handle);

        match (result, released) {
            (Err(error), Err(_release_error)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_release_error, "Failed to release migration lock after error");
                Err(error)
            }
            (Err(error), Ok(())) => Err(error),
            (Ok(_), Err(release_error)) => Err(release_error),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::executor::ChangeSetState;
    use crate::source::{EmbeddedSource, FileSource, ProgrammaticSource};
    use rusqlite::Connection as SqliteConnection;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn users_changelog() -> Vec<ChangeSet> {
        vec![
            ChangeSet::builder("alice", "create-users")
                .sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
                .rollback("DROP TABLE users")
                .build(),
            ChangeSet::builder("alice", "add-email")
                .sql("ALTER TABLE users ADD COLUMN email TEXT")
                .build(),
        ]
    }

    fn migrator() -> Migrator {
        Migrator::from_source(&ProgrammaticSource::new("app", users_changelog())).unwrap()
    }

    #[test]
    fn migrate_then_status_is_up_to_date() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let migrator = migrator();

        let report = migrator.migrate(&mut conn).unwrap();
        assert_eq!(report.applied, 2);
        assert!(migrator.status(&mut conn).unwrap().is_up_to_date());
        assert!(migrator.lock_status(&mut conn).unwrap().is_none());

        let second = migrator.migrate(&mut conn).unwrap();
        assert_eq!(second.applied, 0);
        assert!(second.results.is_empty());
        assert_eq!(migrator.history(&mut conn).unwrap().len(), 2);
    }

    #[test]
    fn status_never_writes() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let migrator = migrator();
        let plan = migrator.status(&mut conn).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(!Connection::table_exists(&mut conn, "changeledger_history").unwrap());
        assert!(!Connection::table_exists(&mut conn, "changeledger_lock").unwrap());
    }

    #[test]
    fn lock_is_released_after_failure() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let migrator = Migrator::from_change_sets(vec![ChangeSet::builder("alice", "broken")
            .source_label("app")
            .sql("NOT SQL AT ALL")
            .build()])
        .unwrap();

        let err = migrator.migrate(&mut conn).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(migrator.lock_status(&mut conn).unwrap().is_none());
        assert!(migrator.history(&mut conn).unwrap().is_empty());
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let mut holder_conn = SqliteConnection::open(&path).unwrap();
        let mut conn = SqliteConnection::open(&path).unwrap();
        crate::sqlite::configure(&holder_conn, Duration::from_secs(5)).unwrap();
        crate::sqlite::configure(&conn, Duration::from_secs(5)).unwrap();

        let holder = LockManager::default().with_owner_id("someone-else");
        holder.ensure_schema(&mut holder_conn).unwrap();
        holder
            .acquire(&mut holder_conn, Duration::from_secs(1), &CancellationToken::new())
            .unwrap();

        let migrator = migrator().with_lock_timeout(Duration::from_millis(100));
        let err = migrator.migrate(&mut conn).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { ref holder, .. } if holder == "someone-else"));
        assert_eq!(err.exit_code(), 3);
        assert!(migrator.history(&mut conn).unwrap().is_empty());

        assert!(migrator.release_locks(&mut conn).unwrap());
        assert_eq!(migrator.migrate(&mut conn).unwrap().applied, 2);
    }

    #[test]
    fn concurrent_instances_apply_each_change_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let executed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let executed = executed.clone();
                thread::spawn(move || {
                    let mut conn = SqliteConnection::open(&path).unwrap();
                    crate::sqlite::configure(&conn, Duration::from_secs(30)).unwrap();
                    let migrator = migrator()
                        .with_lock_settings(LockSettings {
                            initial_backoff: Duration::from_millis(5),
                            max_backoff: Duration::from_millis(20),
                            ..LockSettings::default()
                        })
                        .on_change_set_complete(move |_, _| {
                            executed.fetch_add(1, Ordering::SeqCst);
                        });
                    migrator.migrate(&mut conn).map(|report| report.applied)
                })
            })
            .collect();

        let applied: usize = workers
            .into_iter()
            .map(|worker| worker.join().unwrap().unwrap())
            .sum();
        assert_eq!(applied, 2);
        assert_eq!(executed.load(Ordering::SeqCst), 2);

        let mut conn = SqliteConnection::open(&path).unwrap();
        assert!(migrator().status(&mut conn).unwrap().is_up_to_date());
    }

    #[test]
    fn drift_is_reported_by_validate_and_blocks_migrate() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        migrator().migrate(&mut conn).unwrap();

        let edited = Migrator::from_source(&ProgrammaticSource::new(
            "app",
            vec![
                ChangeSet::builder("alice", "create-users")
                    .sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
                    .build(),
                ChangeSet::builder("alice", "add-email")
                    .sql("ALTER TABLE users ADD COLUMN email TEXT")
                    .build(),
                ChangeSet::builder("alice", "add-index")
                    .sql("CREATE INDEX users_name ON users (name)")
                    .build(),
            ],
        ))
        .unwrap();

        let report = edited.validate(&mut conn).unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.pending, 1);
        assert_eq!(report.drifted.len(), 1);
        assert_eq!(report.drifted[0].identity.id, "create-users");
        assert!(matches!(
            report.into_result(),
            Err(Error::ChecksumMismatch { .. })
        ));

        let err = edited.migrate(&mut conn).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(!Connection::table_exists(&mut conn, "users_name").unwrap());

        let report = edited
            .with_accept_drift(true)
            .migrate(&mut conn)
            .unwrap();
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn rollback_removes_ledger_rows() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let migrator = Migrator::from_change_sets(vec![
            ChangeSet::builder("alice", "create-users")
                .source_label("app")
                .sql("CREATE TABLE users (id INTEGER PRIMARY KEY)")
                .rollback("DROP TABLE users")
                .build(),
            ChangeSet::builder("alice", "create-posts")
                .source_label("app")
                .sql("CREATE TABLE posts (id INTEGER PRIMARY KEY)")
                .rollback("DROP TABLE posts")
                .build(),
        ])
        .unwrap();
        migrator.migrate(&mut conn).unwrap();

        let report = migrator.rollback(&mut conn, 1).unwrap();
        assert_eq!(report.rolled_back.len(), 1);
        assert!(!Connection::table_exists(&mut conn, "posts").unwrap());
        assert_eq!(migrator.status(&mut conn).unwrap().len(), 1);

        let report = migrator.migrate(&mut conn).unwrap();
        assert_eq!(report.results[0].state, ChangeSetState::Committed);
        assert!(Connection::table_exists(&mut conn, "posts").unwrap());
    }

    #[test]
    fn config_is_applied() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let config = EngineConfig::from_yaml_str(
            "ledger_table: app_history\nlock_table: app_lock\nowner_id: deployer\ncontexts: [prod]",
        )
        .unwrap();
        let migrator = Migrator::from_source(&EmbeddedSource::new(
            "app.yaml",
            r#"
changelog:
  - change_set: { id: schema, author: alice, sql: CREATE TABLE t (id INTEGER) }
  - change_set: { id: seed, author: alice, contexts: [dev], sql: INSERT INTO t VALUES (1) }
"#,
        ))
        .unwrap()
        .with_config(&config)
        .unwrap();

        assert_eq!(migrator.lock_manager().owner_id(), "deployer");
        assert_eq!(migrator.lock_manager().table_name(), "app_lock");
        let report = migrator.migrate(&mut conn).unwrap();
        assert_eq!(report.applied, 1);
        assert!(Connection::table_exists(&mut conn, "app_history").unwrap());
        assert!(!Connection::table_exists(&mut conn, "changeledger_history").unwrap());
    }

    #[test]
    fn table_names_must_be_identifiers() {
        let err = migrator()
            .with_ledger_table_name("history; DROP TABLE users")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{:?}", err);
        assert!(migrator().with_lock_table_name("app.lock").is_err());

        let mut config = EngineConfig::default();
        config.lock_table = "lock table".to_string();
        assert!(migrator().with_config(&config).is_err());

        let migrator = migrator().with_lock_table_name("app_lock").unwrap();
        assert_eq!(migrator.lock_manager().table_name(), "app_lock");
    }

    #[test]
    fn empty_registry_is_up_to_date() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let migrator = Migrator::from_change_sets(Vec::new()).unwrap();

        let plan = migrator.status(&mut conn).unwrap();
        assert!(plan.is_up_to_date());
        assert!(plan.unexpected().is_empty());

        let report = migrator.migrate(&mut conn).unwrap();
        assert_eq!(report.applied, 0);
        assert!(report.results.is_empty());
        assert!(migrator.history(&mut conn).unwrap().is_empty());
    }

    #[test]
    fn demo_change_log_migrates() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/changelog/master.yaml");
        let migrator = Migrator::from_source(&FileSource::new(path)).unwrap();

        let report = migrator.migrate(&mut conn).unwrap();
        assert!(report.applied >= 3);
        assert!(migrator.status(&mut conn).unwrap().is_up_to_date());
        assert!(Connection::table_exists(&mut conn, "changeledger_history").unwrap());
    }
}
