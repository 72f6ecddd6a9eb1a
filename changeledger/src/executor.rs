//! Applies a [MigrationPlan] one change-set at a time.

use crate::cancel::CancellationToken;
use crate::connection::{Connection, Transaction};
use crate::core::{ChangeSet, ExecutionMode, Identity, PreconditionCheck, PreconditionPolicy};
use crate::error::{Error, Result};
use crate::history::{AppliedRecord, HistoryStore, Outcome};
use crate::lock::{LockHandle, LockManager};
use crate::planner::{MigrationPlan, PlanReason};
use crate::registry::Registry;
use chrono::Utc;
use std::time::{Duration, Instant};

/// Lifecycle of a change-set during an apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetState {
    Pending,
    Executing,
    /// Operations and ledger row committed together (or, for non-transactional
    /// change-sets, operations completed and the ledger row committed).
    Committed,
    /// The operations failed and were rolled back; the change-set was recorded as
    /// failed and the run continued.
    RolledBack,
    /// A precondition did not hold under the `mark_ran` policy.
    Skipped,
    /// Failed without a rollback: a non-transactional change-set whose failure was
    /// recorded and tolerated.
    Failed,
}

/// What happened to one change-set of the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSetResult {
    pub identity: Identity,
    pub state: ChangeSetState,
    /// The outcome written to the ledger, if the change-set got that far.
    pub outcome: Option<Outcome>,
    pub duration: Duration,
}

/// Summary of an apply run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Number of change-sets whose operations were committed.
    pub applied: usize,
    pub elapsed: Duration,
    /// Every change-set of the plan, in plan order.
    pub results: Vec<ChangeSetResult>,
    pub deployment_id: String,
}

impl ExecutionReport {
    pub fn results_in(&self, state: ChangeSetState) -> impl Iterator<Item = &ChangeSetResult> {
        self.results.iter().filter(move |result| result.state == state)
    }
}

/// Summary of an explicit rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    /// Rolled back change-sets, most recent first.
    pub rolled_back: Vec<Identity>,
    pub elapsed: Duration,
}

/// Observability callbacks invoked around each change-set.
#[derive(Default)]
pub struct Hooks {
    pub(crate) on_change_set_start: Option<Box<dyn Fn(&Identity) + Send + Sync>>,
    pub(crate) on_change_set_complete: Option<Box<dyn Fn(&Identity, Duration) + Send + Sync>>,
    pub(crate) on_change_set_skipped: Option<Box<dyn Fn(&Identity) + Send + Sync>>,
    pub(crate) on_change_set_error: Option<Box<dyn Fn(&Identity, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_change_set_start", &self.on_change_set_start.is_some())
            .field(
                "on_change_set_complete",
                &self.on_change_set_complete.is_some(),
            )
            .field("on_change_set_skipped", &self.on_change_set_skipped.is_some())
            .field("on_change_set_error", &self.on_change_set_error.is_some())
            .finish()
    }
}

impl Hooks {
    fn start(&self, identity: &Identity) {
        if let Some(ref callback) = self.on_change_set_start {
            callback(identity);
        }
    }

    fn complete(&self, identity: &Identity, duration: Duration) {
        if let Some(ref callback) = self.on_change_set_complete {
            callback(identity, duration);
        }
    }

    fn skipped(&self, identity: &Identity) {
        if let Some(ref callback) = self.on_change_set_skipped {
            callback(identity);
        }
    }

    fn error(&self, identity: &Identity, error: &Error) {
        if let Some(ref callback) = self.on_change_set_error {
            callback(identity, error);
        }
    }
}

/// Everything a run needs besides the plan: the connection, the lock being held, the
/// deadline, the cancellation token and the deployment id stamped on ledger rows.
pub struct ExecutionContext<'a> {
    conn: &'a mut dyn Connection,
    lock: Option<(&'a LockManager, &'a LockHandle)>,
    limits: Limits<'a>,
    deployment_id: String,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(conn: &'a mut dyn Connection, cancel: &'a CancellationToken) -> Self {
        Self {
            conn,
            lock: None,
            limits: Limits {
                deadline: None,
                cancel,
            },
            deployment_id: new_deployment_id(),
        }
    }

    /// Heartbeat this lock between change-sets.
    pub fn with_lock(mut self, manager: &'a LockManager, handle: &'a LockHandle) -> Self {
        self.lock = Some((manager, handle));
        self
    }

    /// Fail with [Error::ApplyTimeout] once `limit` has elapsed from now.
    pub fn with_max_duration(mut self, limit: Duration) -> Self {
        self.limits.deadline = Some((Instant::now() + limit, limit));
        self
    }

    pub fn with_deployment_id(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = deployment_id.into();
        self
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    fn heartbeat(&mut self) -> Result<()> {
        if let Some((manager, handle)) = self.lock {
            manager.heartbeat(&mut *self.conn, handle)?;
        }
        Ok(())
    }
}

pub(crate) fn new_deployment_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The deadline and cancellation checks, copied out so they can be consulted while the
/// connection is borrowed by a transaction.
#[derive(Clone, Copy)]
struct Limits<'a> {
    deadline: Option<(Instant, Duration)>,
    cancel: &'a CancellationToken,
}

impl Limits<'_> {
    fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some((deadline, limit)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::ApplyTimeout { limit });
            }
        }
        Ok(())
    }
}

/// Result of running a change-set's operations: `Err((index, error))` names the
/// failing operation.
type OperationsResult = std::result::Result<(), (usize, Error)>;

/// Runs plans and rollbacks against a connection, writing the ledger as it goes.
#[derive(Debug)]
pub struct Executor<'a> {
    history: &'a HistoryStore,
    hooks: &'a Hooks,
}

impl<'a> Executor<'a> {
    pub fn new(history: &'a HistoryStore, hooks: &'a Hooks) -> Self {
        Self { history, hooks }
    }

    /// Apply every change-set of the plan in order.
    ///
    /// Halts at the first failing change-set (unless it is `fail_on_error: false`),
    /// leaving the database at the last committed change-set.
    pub fn execute(
        &self,
        plan: &MigrationPlan<'_>,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        self.history.ensure_schema(&mut *ctx.conn)?;

        let mut results: Vec<ChangeSetResult> = plan
            .entries()
            .iter()
            .map(|entry| ChangeSetResult {
                identity: entry.change_set.identity().clone(),
                state: ChangeSetState::Pending,
                outcome: None,
                duration: Duration::ZERO,
            })
            .collect();
        let mut applied = 0;

        for (index, entry) in plan.entries().iter().enumerate() {
            let change_set = entry.change_set;
            results[index].state = ChangeSetState::Executing;

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "change_set",
                id = %change_set.id(),
                author = %change_set.author(),
                source = %change_set.source_label()
            )
            .entered();

            let change_set_start = Instant::now();
            match self.apply_one(change_set, entry.reason, ctx) {
                Ok((state, outcome)) => {
                    let duration = change_set_start.elapsed();
                    if state == ChangeSetState::Committed {
                        applied += 1;
                    }
                    results[index].state = state;
                    results[index].outcome = Some(outcome);
                    results[index].duration = duration;
                }
                Err(error) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        error = %error,
                        committed = applied,
                        remaining = results.len() - index - 1,
                        "Apply run halted"
                    );
                    return Err(error);
                }
            }

            ctx.heartbeat()?;
        }

        Ok(ExecutionReport {
            applied,
            elapsed: started.elapsed(),
            results,
            deployment_id: ctx.deployment_id.clone(),
        })
    }

    fn apply_one(
        &self,
        change_set: &ChangeSet,
        reason: PlanReason,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<(ChangeSetState, Outcome)> {
        let limits = ctx.limits;
        limits.check()?;

        #[cfg(feature = "tracing")]
        tracing::info!(reason = ?reason, "Starting change-set");
        self.hooks.start(change_set.identity());

        let started = Instant::now();
        let success_outcome = match reason {
            PlanReason::New => Outcome::Executed,
            PlanReason::RunAlways | PlanReason::RunOnChange => Outcome::Reran,
        };
        let deployment_id = ctx.deployment_id.clone();

        match change_set.execution() {
            ExecutionMode::Transactional => {
                let mut tx = Transaction::begin(&mut *ctx.conn)?;

                if let Some(unmet) = self.check_preconditions(&mut tx, change_set)? {
                    return match change_set.preconditions().on_fail {
                        PreconditionPolicy::Halt => {
                            drop(tx);
                            Err(self.fail(change_set, unmet))
                        }
                        PreconditionPolicy::MarkRan => {
                            self.record(&mut tx, change_set, Outcome::MarkRan, started, &deployment_id)?;
                            tx.commit()
                                .map_err(|e| Error::persistence("commit mark-ran change-set", e))?;
                            self.mark_skipped(change_set, unmet);
                            Ok((ChangeSetState::Skipped, Outcome::MarkRan))
                        }
                    };
                }

                if let Err((operation_index, source)) =
                    run_operations(&mut tx, change_set, limits)
                {
                    let error = match source {
                        Error::Cancelled | Error::ApplyTimeout { .. } => source,
                        source => Error::ChangeSetExecution {
                            identity: change_set.identity().clone(),
                            operation_index,
                            source: Box::new(source),
                        },
                    };
                    if let Err(_rollback_error) = tx.rollback() {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_rollback_error, "Rollback of failed change-set failed");
                    }

                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %error, "Change-set failed");
                    self.hooks.error(change_set.identity(), &error);

                    if change_set.fail_on_error() || !matches!(error, Error::ChangeSetExecution { .. }) {
                        return Err(error);
                    }
                    let mut tx = Transaction::begin(&mut *ctx.conn)?;
                    self.record(&mut tx, change_set, Outcome::Failed, started, &deployment_id)?;
                    tx.commit()
                        .map_err(|e| Error::persistence("commit failed change-set record", e))?;
                    return Ok((ChangeSetState::RolledBack, Outcome::Failed));
                }

                self.record(&mut tx, change_set, success_outcome, started, &deployment_id)?;
                tx.commit().map_err(|e| {
                    Error::persistence(format!("commit change-set {}", change_set.identity()), e)
                })?;
            }
            ExecutionMode::NonTransactional => {
                if let Some(unmet) = self.check_preconditions(&mut *ctx.conn, change_set)? {
                    return match change_set.preconditions().on_fail {
                        PreconditionPolicy::Halt => Err(self.fail(change_set, unmet)),
                        PreconditionPolicy::MarkRan => {
                            self.record_in_transaction(
                                &mut *ctx.conn,
                                change_set,
                                Outcome::MarkRan,
                                started,
                                &deployment_id,
                            )?;
                            self.mark_skipped(change_set, unmet);
                            Ok((ChangeSetState::Skipped, Outcome::MarkRan))
                        }
                    };
                }

                if let Err((operation_index, source)) =
                    run_operations(&mut *ctx.conn, change_set, limits)
                {
                    let error = match source {
                        Error::Cancelled | Error::ApplyTimeout { .. } => source,
                        source => Error::ChangeSetExecution {
                            identity: change_set.identity().clone(),
                            operation_index,
                            source: Box::new(source),
                        },
                    };

                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        error = %error,
                        completed_operations = operation_index,
                        "Non-transactional change-set failed; earlier operations stay applied"
                    );
                    self.hooks.error(change_set.identity(), &error);

                    if change_set.fail_on_error() || !matches!(error, Error::ChangeSetExecution { .. }) {
                        return Err(error);
                    }
                    self.record_in_transaction(
                        &mut *ctx.conn,
                        change_set,
                        Outcome::Failed,
                        started,
                        &deployment_id,
                    )?;
                    return Ok((ChangeSetState::Failed, Outcome::Failed));
                }

                self.record_in_transaction(
                    &mut *ctx.conn,
                    change_set,
                    success_outcome,
                    started,
                    &deployment_id,
                )?;
            }
        }

        let duration = started.elapsed();

        #[cfg(feature = "tracing")]
        tracing::info!(
            duration_ms = duration.as_millis(),
            "Change-set completed successfully"
        );
        self.hooks.complete(change_set.identity(), duration);

        Ok((ChangeSetState::Committed, success_outcome))
    }

    /// Returns a description of the first check that does not hold.
    fn check_preconditions(
        &self,
        conn: &mut dyn Connection,
        change_set: &ChangeSet,
    ) -> Result<Option<String>> {
        for check in &change_set.preconditions().checks {
            let holds = evaluate(conn, check).map_err(|e| {
                let error = Error::PreconditionFailed {
                    identity: change_set.identity().clone(),
                    reason: format!("could not evaluate {}: {}", check, e),
                };
                self.hooks.error(change_set.identity(), &error);
                error
            })?;
            if !holds {
                return Ok(Some(format!("expected {}", check)));
            }
        }
        Ok(None)
    }

    fn fail(&self, change_set: &ChangeSet, unmet: String) -> Error {
        let error = Error::PreconditionFailed {
            identity: change_set.identity().clone(),
            reason: unmet,
        };

        #[cfg(feature = "tracing")]
        tracing::error!(error = %error, "Precondition check failed");
        self.hooks.error(change_set.identity(), &error);

        error
    }

    fn mark_skipped(&self, change_set: &ChangeSet, _unmet: String) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            precondition = %_unmet,
            "Precondition not met, marking change-set as ran without executing it"
        );
        self.hooks.skipped(change_set.identity());
    }

    fn record(
        &self,
        conn: &mut dyn Connection,
        change_set: &ChangeSet,
        outcome: Outcome,
        started: Instant,
        deployment_id: &str,
    ) -> Result<()> {
        let sequence_no = self.history.next_sequence(conn)?;
        self.history.record_applied(
            conn,
            &AppliedRecord {
                identity: change_set.identity().clone(),
                checksum: change_set.checksum().to_string(),
                applied_at: Utc::now(),
                sequence_no,
                duration: started.elapsed(),
                outcome,
                description: change_set.description().map(str::to_string),
                deployment_id: deployment_id.to_string(),
            },
        )
    }

    fn record_in_transaction(
        &self,
        conn: &mut dyn Connection,
        change_set: &ChangeSet,
        outcome: Outcome,
        started: Instant,
        deployment_id: &str,
    ) -> Result<()> {
        let mut tx = Transaction::begin(conn)?;
        self.record(&mut tx, change_set, outcome, started, deployment_id)?;
        tx.commit().map_err(|e| {
            Error::persistence(format!("commit ledger row for {}", change_set.identity()), e)
        })
    }

    /// Undo the `count` most recently applied change-sets, newest first.
    ///
    /// Every selected change-set must still be in the registry and declare rollback
    /// statements; this is checked before anything is rolled back. Each rollback runs in
    /// its own transaction together with the removal of the ledger row.
    ///
    /// Rows recorded as `mark_ran`, or `failed` on a transactional change-set, never
    /// changed the schema, so for those only the ledger row is removed.
    pub fn roll_back(
        &self,
        registry: &Registry,
        count: usize,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<RollbackReport> {
        let started = Instant::now();
        if count == 0 || !self.history.exists(&mut *ctx.conn)? {
            return Ok(RollbackReport {
                rolled_back: Vec::new(),
                elapsed: started.elapsed(),
            });
        }

        let mut records = self.history.list_applied(&mut *ctx.conn)?;
        records.reverse();
        records.truncate(count);

        let mut targets = Vec::with_capacity(records.len());
        for record in &records {
            let change_set = registry.get(&record.identity).ok_or_else(|| {
                Error::InvalidOperation {
                    identity: record.identity.clone(),
                    reason: "cannot roll back a change-set that is not in the registry"
                        .to_string(),
                }
            })?;
            let run_statements = match record.outcome {
                Outcome::MarkRan => false,
                Outcome::Failed => change_set.execution() == ExecutionMode::NonTransactional,
                Outcome::Executed | Outcome::Reran => true,
            };
            if run_statements && change_set.rollback_operations().is_empty() {
                return Err(Error::InvalidOperation {
                    identity: record.identity.clone(),
                    reason: "the change-set declares no rollback statements".to_string(),
                });
            }
            targets.push((change_set, run_statements));
        }

        let limits = ctx.limits;
        let mut rolled_back = Vec::with_capacity(targets.len());
        for (change_set, run_statements) in targets {
            limits.check()?;

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "change_set_rollback",
                id = %change_set.id(),
                author = %change_set.author(),
                source = %change_set.source_label()
            )
            .entered();

            #[cfg(feature = "tracing")]
            tracing::info!("Rolling back change-set");
            self.hooks.start(change_set.identity());
            let change_set_start = Instant::now();

            let statements: &[String] = if run_statements {
                change_set.rollback_operations()
            } else {
                #[cfg(feature = "tracing")]
                tracing::info!("Change-set never ran; removing its ledger row only");
                &[]
            };

            let mut tx = Transaction::begin(&mut *ctx.conn)?;
            for (operation_index, statement) in statements.iter().enumerate() {
                if let Err(source) = tx.batch(statement) {
                    let error = Error::ChangeSetExecution {
                        identity: change_set.identity().clone(),
                        operation_index,
                        source: Box::new(source),
                    };

                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %error, "Rollback failed");
                    self.hooks.error(change_set.identity(), &error);

                    return Err(error);
                }
            }
            self.history.remove(&mut tx, change_set.identity())?;
            tx.commit().map_err(|e| {
                Error::persistence(format!("commit rollback of {}", change_set.identity()), e)
            })?;

            let duration = change_set_start.elapsed();

            #[cfg(feature = "tracing")]
            tracing::info!(
                duration_ms = duration.as_millis(),
                "Rollback completed successfully"
            );
            self.hooks.complete(change_set.identity(), duration);

            rolled_back.push(change_set.identity().clone());
            ctx.heartbeat()?;
        }

        Ok(RollbackReport {
            rolled_back,
            elapsed: started.elapsed(),
        })
    }
}

fn run_operations(conn: &mut dyn Connection, change_set: &ChangeSet, limits: Limits<'_>) -> OperationsResult {
    for (index, operation) in change_set.operations().iter().enumerate() {
        limits.check().map_err(|e| (index, e))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(operation_index = index, "Executing operation");

        conn.batch(operation).map_err(|e| (index, e))?;
    }
    Ok(())
}

fn evaluate(conn: &mut dyn Connection, check: &PreconditionCheck) -> Result<bool> {
    Ok(match check {
        PreconditionCheck::TableExists(table) => conn.table_exists(table)?,
        PreconditionCheck::TableNotExists(table) => !conn.table_exists(table)?,
        PreconditionCheck::SqlCheck { sql, expected } => {
            let rows = conn.query_rows(sql, &[])?;
            let actual = rows
                .first()
                .and_then(|row| row.first())
                .map(|value| value.to_string());
            actual.as_deref() == Some(expected.as_str())
        }
    })
}
