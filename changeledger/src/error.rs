use crate::core::Identity;
use std::time::Duration;

/// Error type for the changeledger crate.
///
/// Every engine failure is returned to the caller; nothing is swallowed. Variants that
/// concern a single change-set carry its [Identity], and variants wrapping a database
/// failure keep the underlying error as their `source`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A descriptor could not be turned into a change-set: missing identity fields,
    /// duplicate identity, or an unreadable / unparsable source.
    #[error("malformed change-set descriptor in '{source_label}': {reason}")]
    MalformedDescriptor { source_label: String, reason: String },

    /// The change-set's content is not stable enough to be checksummed, or it cannot be
    /// used for the requested operation (e.g. rollback without rollback statements).
    #[error("invalid operation in change-set {identity}: {reason}")]
    InvalidOperation { identity: Identity, reason: String },

    /// A previously applied change-set no longer hashes to the checksum in the ledger.
    #[error(
        "checksum mismatch for change-set {identity}: ledger has '{stored}' but current content hashes to '{current}'. \
        This indicates the change-set was modified after being applied."
    )]
    ChecksumMismatch {
        identity: Identity,
        stored: String,
        current: String,
    },

    /// The migration lock was held by another owner for the whole wait.
    #[error("could not acquire the migration lock within {waited:?}; it is held by '{holder}'")]
    LockTimeout { waited: Duration, holder: String },

    /// The lock row disappeared or changed owner while a run was in progress.
    #[error("the migration lock owned by '{owner}' was lost")]
    LockLost { owner: String },

    #[error("operation cancelled")]
    Cancelled,

    /// The apply operation ran past its configured maximum duration.
    #[error("apply operation exceeded its maximum duration of {limit:?}")]
    ApplyTimeout { limit: Duration },

    /// A ledger or lock write (or the commit carrying it) failed.
    #[error("failed to {action}: {source}")]
    Persistence {
        action: String,
        #[source]
        source: Box<Error>,
    },

    /// A precondition did not hold and the change-set's policy is to halt.
    #[error("precondition failed for change-set {identity}: {reason}")]
    PreconditionFailed { identity: Identity, reason: String },

    /// One of the change-set's operations failed; the plan was halted.
    #[error("change-set {identity} failed at operation {operation_index}: {source}")]
    ChangeSetExecution {
        identity: Identity,
        operation_index: usize,
        #[source]
        source: Box<Error>,
    },

    /// Engine configuration could not be read or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Sqlite(rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),

    #[error("{0}")]
    Generic(String),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Process exit code a command-line wrapper should use for this error.
    ///
    /// `2` for a failed change-set, `3` for lock contention, `4` for checksum drift and
    /// `1` for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::ChangeSetExecution { .. } => 2,
            Error::LockTimeout { .. } => 3,
            Error::ChecksumMismatch { .. } => 4,
            _ => 1,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }

    pub(crate) fn persistence(action: impl Into<String>, source: Error) -> Self {
        Error::Persistence {
            action: action.into(),
            source: Box::new(source),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::new("alice", "1", "master.yaml")
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        let failed = Error::ChangeSetExecution {
            identity: identity(),
            operation_index: 0,
            source: Box::new(Error::Generic("boom".to_string())),
        };
        assert_eq!(failed.exit_code(), 2);

        let timeout = Error::LockTimeout {
            waited: Duration::from_secs(1),
            holder: "other".to_string(),
        };
        assert_eq!(timeout.exit_code(), 3);
        assert!(timeout.is_retryable());

        let drift = Error::ChecksumMismatch {
            identity: identity(),
            stored: "a".to_string(),
            current: "b".to_string(),
        };
        assert_eq!(drift.exit_code(), 4);
        assert!(!drift.is_retryable());

        assert_eq!(Error::Cancelled.exit_code(), 1);
    }

    #[test]
    fn execution_error_names_change_set_and_operation() {
        let err = Error::ChangeSetExecution {
            identity: identity(),
            operation_index: 3,
            source: Box::new(Error::Generic("syntax error".to_string())),
        };
        let message = err.to_string();
        assert!(message.contains("master.yaml::1::alice"), "{message}");
        assert!(message.contains("operation 3"), "{message}");
        assert!(message.contains("syntax error"), "{message}");
    }
}
