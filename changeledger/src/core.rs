use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// The identity of a change-set: `(author, id, source-label)`.
///
/// The identity must be unique within a registry and must never change once the
/// change-set has been applied to any database; the ledger is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub author: String,
    pub id: String,
    pub source_label: String,
}

impl Identity {
    pub fn new(
        author: impl Into<String>,
        id: impl Into<String>,
        source_label: impl Into<String>,
    ) -> Self {
        Self {
            author: author.into(),
            id: id.into(),
            source_label: source_label.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.source_label, self.id, self.author)
    }
}

/// How a change-set's operations are wrapped when applied.
///
/// Some statements (for example `CREATE INDEX CONCURRENTLY` on PostgreSQL) cannot run
/// inside a transaction; such change-sets opt into [ExecutionMode::NonTransactional].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Preconditions, operations and the ledger write share one transaction.
    #[default]
    Transactional,
    /// Operations run in autocommit mode; the ledger row is written afterwards.
    /// A failure part way through can leave earlier operations applied.
    NonTransactional,
}

/// What to do when a change-set's precondition does not hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionPolicy {
    /// Fail the change-set and stop the run.
    #[default]
    Halt,
    /// Record the change-set as ran without executing it, and continue.
    MarkRan,
}

/// A single check evaluated before a change-set runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionCheck {
    TableExists(String),
    TableNotExists(String),
    /// Runs `sql` and compares the first column of the first row, rendered as text,
    /// with `expected`.
    SqlCheck { sql: String, expected: String },
}

impl fmt::Display for PreconditionCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionCheck::TableExists(table) => write!(f, "table '{}' exists", table),
            PreconditionCheck::TableNotExists(table) => {
                write!(f, "table '{}' does not exist", table)
            }
            PreconditionCheck::SqlCheck { sql, expected } => {
                write!(f, "`{}` returns '{}'", sql, expected)
            }
        }
    }
}

/// The preconditions attached to a change-set. All checks must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub on_fail: PreconditionPolicy,
    pub checks: Vec<PreconditionCheck>,
}

impl Preconditions {
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

/// An atomic, identified, ordered unit of schema or data change.
///
/// A change-set is immutable once built. Its checksum is computed from its operation
/// list when it is built and is what the ledger compares against on later runs.
///
/// # IMPORTANT WARNING
///
/// **Once a change-set has been applied to any database, neither its identity nor its
/// operations may change.** Editing the operations changes the checksum and every later
/// run fails with [Error::ChecksumMismatch](crate::Error::ChecksumMismatch), unless the
/// change-set is marked `run_on_change` or the new checksum is accepted explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    identity: Identity,
    description: Option<String>,
    operations: Vec<String>,
    rollback: Vec<String>,
    execution: ExecutionMode,
    preconditions: Preconditions,
    run_always: bool,
    run_on_change: bool,
    fail_on_error: bool,
    contexts: Vec<String>,
    accepted_checksums: Vec<String>,
    checksum: String,
}

impl ChangeSet {
    /// Start building a change-set. The source label defaults to empty and is filled in
    /// by the descriptor source the change-set is registered through.
    pub fn builder(author: impl Into<String>, id: impl Into<String>) -> ChangeSetBuilder {
        ChangeSetBuilder::new(author, id)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn author(&self) -> &str {
        &self.identity.author
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn source_label(&self) -> &str {
        &self.identity.source_label
    }

    /// A free-form description. Unlike the identity it is not part of the checksum and
    /// can be edited at any time.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    pub fn rollback_operations(&self) -> &[String] {
        &self.rollback
    }

    pub fn execution(&self) -> ExecutionMode {
        self.execution
    }

    pub fn preconditions(&self) -> &Preconditions {
        &self.preconditions
    }

    /// Re-run on every `migrate`, even when already applied.
    pub fn run_always(&self) -> bool {
        self.run_always
    }

    /// Re-run when the content changed since it was applied, instead of reporting drift.
    pub fn run_on_change(&self) -> bool {
        self.run_on_change
    }

    /// When `false`, a failing change-set is rolled back, recorded with outcome
    /// `failed`, and the run continues.
    pub fn fail_on_error(&self) -> bool {
        self.fail_on_error
    }

    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Whether a ledger checksum should be treated as matching this change-set.
    pub fn accepts_checksum(&self, checksum: &str) -> bool {
        self.checksum == checksum || self.accepted_checksums.iter().any(|c| c == checksum)
    }

    /// Whether this change-set runs under the given active contexts.
    /// A change-set without contexts runs everywhere, and an empty active set runs
    /// every change-set.
    pub fn matches_contexts(&self, active: &[String]) -> bool {
        self.contexts.is_empty()
            || active.is_empty()
            || self
                .contexts
                .iter()
                .any(|c| active.iter().any(|a| a.eq_ignore_ascii_case(c)))
    }

    pub(crate) fn with_source_label(mut self, label: &str) -> Self {
        self.identity.source_label = label.to_string();
        self
    }
}

/// Builder for [ChangeSet]s defined in code.
///
/// ```
/// use changeledger::{ChangeSet, ExecutionMode};
///
/// let change_set = ChangeSet::builder("alice", "create-users")
///     .description("Create the users table")
///     .sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
///     .rollback("DROP TABLE users")
///     .build();
///
/// assert_eq!(change_set.execution(), ExecutionMode::Transactional);
/// assert_eq!(change_set.operations().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ChangeSetBuilder {
    identity: Identity,
    description: Option<String>,
    operations: Vec<String>,
    rollback: Vec<String>,
    execution: ExecutionMode,
    preconditions: Preconditions,
    run_always: bool,
    run_on_change: bool,
    fail_on_error: bool,
    contexts: Vec<String>,
    accepted_checksums: Vec<String>,
}

impl ChangeSetBuilder {
    fn new(author: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(author, id, ""),
            description: None,
            operations: Vec::new(),
            rollback: Vec::new(),
            execution: ExecutionMode::default(),
            preconditions: Preconditions::default(),
            run_always: false,
            run_on_change: false,
            fail_on_error: true,
            contexts: Vec::new(),
            accepted_checksums: Vec::new(),
        }
    }

    pub fn source_label(mut self, label: impl Into<String>) -> Self {
        self.identity.source_label = label.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append one operation (a raw SQL statement).
    pub fn sql(mut self, statement: impl Into<String>) -> Self {
        self.operations.push(statement.into());
        self
    }

    pub fn sql_all<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations
            .extend(statements.into_iter().map(Into::into));
        self
    }

    /// Append one rollback statement, run by an explicit rollback.
    pub fn rollback(mut self, statement: impl Into<String>) -> Self {
        self.rollback.push(statement.into());
        self
    }

    pub fn rollback_all<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rollback.extend(statements.into_iter().map(Into::into));
        self
    }

    pub fn execution(mut self, mode: ExecutionMode) -> Self {
        self.execution = mode;
        self
    }

    pub fn precondition(mut self, check: PreconditionCheck) -> Self {
        self.preconditions.checks.push(check);
        self
    }

    pub fn on_precondition_fail(mut self, policy: PreconditionPolicy) -> Self {
        self.preconditions.on_fail = policy;
        self
    }

    pub fn run_always(mut self, run_always: bool) -> Self {
        self.run_always = run_always;
        self
    }

    pub fn run_on_change(mut self, run_on_change: bool) -> Self {
        self.run_on_change = run_on_change;
        self
    }

    pub fn fail_on_error(mut self, fail_on_error: bool) -> Self {
        self.fail_on_error = fail_on_error;
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.contexts.push(context.into());
        self
    }

    /// Treat a previously recorded checksum as valid for this change-set.
    pub fn accept_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.accepted_checksums.push(checksum.into());
        self
    }

    pub fn build(self) -> ChangeSet {
        let checksum = calculate_checksum(&self.operations);
        ChangeSet {
            identity: self.identity,
            description: self.description,
            operations: self.operations,
            rollback: self.rollback,
            execution: self.execution,
            preconditions: self.preconditions,
            run_always: self.run_always,
            run_on_change: self.run_on_change,
            fail_on_error: self.fail_on_error,
            contexts: self.contexts,
            accepted_checksums: self.accepted_checksums,
            checksum,
        }
    }
}

/// Calculate the checksum of an operation list.
///
/// Each operation is normalized first (line endings unified, trailing whitespace on
/// every line and surrounding blank space dropped) so that cosmetic edits to a
/// descriptor file do not register as drift.
pub fn calculate_checksum(operations: &[String]) -> String {
    let mut hasher = Sha256::new();
    for operation in operations {
        let normalized = normalize_operation(operation);
        hasher.update((normalized.len() as u64).to_le_bytes());
        hasher.update(normalized.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub(crate) fn normalize_operation(operation: &str) -> String {
    operation
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_ignores_cosmetic_whitespace() {
        let a = calculate_checksum(&["CREATE TABLE t (id INTEGER)".to_string()]);
        let b = calculate_checksum(&["  CREATE TABLE t (id INTEGER)  \r\n".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn checksum_depends_on_content_and_order() {
        let one = calculate_checksum(&["A".to_string(), "B".to_string()]);
        let swapped = calculate_checksum(&["B".to_string(), "A".to_string()]);
        let joined = calculate_checksum(&["A\n;\nB".to_string()]);
        assert_ne!(one, swapped);
        assert_ne!(
            calculate_checksum(&["A".to_string()]),
            calculate_checksum(&["A2".to_string()])
        );
        assert_ne!(one, joined);
    }

    #[test]
    fn description_and_flags_do_not_affect_checksum() {
        let plain = ChangeSet::builder("alice", "1").sql("SELECT 1").build();
        let decorated = ChangeSet::builder("alice", "1")
            .description("something")
            .run_on_change(true)
            .context("dev")
            .sql("SELECT 1")
            .build();
        assert_eq!(plain.checksum(), decorated.checksum());
    }

    #[test]
    fn contexts_match_case_insensitively() {
        let cs = ChangeSet::builder("alice", "1")
            .context("Dev")
            .sql("SELECT 1")
            .build();
        assert!(cs.matches_contexts(&[]));
        assert!(cs.matches_contexts(&["dev".to_string()]));
        assert!(!cs.matches_contexts(&["prod".to_string()]));

        let everywhere = ChangeSet::builder("alice", "2").sql("SELECT 1").build();
        assert!(everywhere.matches_contexts(&["prod".to_string()]));
    }

    #[test]
    fn accepted_checksums_extend_the_current_one() {
        let cs = ChangeSet::builder("alice", "1")
            .sql("SELECT 1")
            .accept_checksum("deadbeef")
            .build();
        assert!(cs.accepts_checksum(cs.checksum()));
        assert!(cs.accepts_checksum("deadbeef"));
        assert!(!cs.accepts_checksum("cafebabe"));
    }

    #[test]
    fn identity_display_is_label_id_author() {
        let identity = Identity::new("bob", "add-email", "db/users.yaml");
        assert_eq!(identity.to_string(), "db/users.yaml::add-email::bob");
    }
}
