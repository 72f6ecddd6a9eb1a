//! Convenience macros for defining change-sets in code.

/// Define a SQL-only change-set.
///
/// Expands to a [`ChangeSet`](crate::ChangeSet) expression, built with
/// [`ChangeSet::builder`](crate::ChangeSet::builder). The source label is left empty and
/// filled in by the [`ProgrammaticSource`](crate::ProgrammaticSource) the change-set is
/// registered through.
///
/// # Basic Usage
///
/// ```
/// use changeledger::change_set;
///
/// let cs = change_set!("alice", "create-users", "Create users table",
///     up: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
///     down: "DROP TABLE users"
/// );
/// assert_eq!(cs.id(), "create-users");
/// assert_eq!(cs.description(), Some("Create users table"));
/// ```
///
/// # Up-Only Change-Sets
///
/// Omit `down` when the change-set should never be rolled back. An explicit rollback
/// of such a change-set fails with [`Error::InvalidOperation`](crate::Error::InvalidOperation).
///
/// ```
/// use changeledger::change_set;
///
/// let cs = change_set!("alice", "create-users", "Create users table",
///     up: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"
/// );
/// assert!(cs.rollback_operations().is_empty());
/// ```
///
/// # Multiple Statements
///
/// ```
/// use changeledger::change_set;
///
/// let cs = change_set!("alice", "initial-schema", "Create initial schema",
///     up: [
///         "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
///         "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT)",
///         "CREATE INDEX idx_posts_user ON posts(user_id)"
///     ],
///     down: [
///         "DROP INDEX idx_posts_user",
///         "DROP TABLE posts",
///         "DROP TABLE users"
///     ]
/// );
/// assert_eq!(cs.operations().len(), 3);
/// ```
///
/// For preconditions, contexts or a non-transactional execution mode, use
/// [`ChangeSet::builder`](crate::ChangeSet::builder) directly.
#[macro_export]
macro_rules! change_set {
    ($author:expr, $id:expr, $description:expr,
        up: [$($up_sql:expr),* $(,)?],
        down: [$($down_sql:expr),* $(,)?]
    ) => {
        $crate::__change_set_impl!($author, $id, $description,
            up: [$($up_sql),*],
            down: [$($down_sql),*]
        )
    };

    ($author:expr, $id:expr, $description:expr,
        up: $up_sql:expr,
        down: $down_sql:expr
    ) => {
        $crate::__change_set_impl!($author, $id, $description,
            up: [$up_sql],
            down: [$down_sql]
        )
    };

    ($author:expr, $id:expr, $description:expr,
        up: [$($up_sql:expr),* $(,)?]
    ) => {
        $crate::__change_set_impl!($author, $id, $description,
            up: [$($up_sql),*],
            down: []
        )
    };

    ($author:expr, $id:expr, $description:expr,
        up: $up_sql:expr
    ) => {
        $crate::__change_set_impl!($author, $id, $description,
            up: [$up_sql],
            down: []
        )
    };
}

/// Internal implementation macro.
#[macro_export]
#[doc(hidden)]
macro_rules! __change_set_impl {
    ($author:expr, $id:expr, $description:expr,
        up: [$($up_sql:expr),*],
        down: [$($down_sql:expr),*]
    ) => {
        $crate::ChangeSet::builder($author, $id)
            .description($description)
            $(.sql($up_sql))*
            $(.rollback($down_sql))*
            .build()
    };
}
