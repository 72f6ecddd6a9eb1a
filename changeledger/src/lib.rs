#![cfg_attr(docsrs, feature(doc_cfg))]
//! `changeledger` is an embeddable schema migration engine.
//!
//! Core concepts:
//! - A **change-set** is the unit of change: an ordered list of SQL statements identified
//!   by `(author, id, source label)`, with an optional rollback, preconditions and
//!   contexts.
//! - A **change-log** is the ordered collection of change-sets, read from YAML files
//!   (which may include one another), from an embedded document, or built in code.
//! - The **ledger** is a table in the target database recording every applied
//!   change-set together with a checksum of its content, so that edits to already-applied
//!   change-sets are detected instead of silently ignored.
//! - The **lock** is a single-row table that serializes concurrent deployments against
//!   the same database.
//!
//! # Usage
//!
//! ```
//! # #[cfg(feature = "sqlite")]
//! # {
//! use changeledger::{EmbeddedSource, Migrator};
//!
//! let source = EmbeddedSource::new(
//!     "app.yaml",
//!     r#"
//! changelog:
//!   - change_set:
//!       id: "1"
//!       author: alice
//!       sql: CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)
//!       rollback: DROP TABLE users
//! "#,
//! );
//! let migrator = Migrator::from_source(&source).unwrap();
//!
//! let mut conn = rusqlite::Connection::open_in_memory().unwrap();
//! assert_eq!(migrator.status(&mut conn).unwrap().len(), 1);
//!
//! let report = migrator.migrate(&mut conn).unwrap();
//! assert_eq!(report.applied, 1);
//! assert!(migrator.status(&mut conn).unwrap().is_up_to_date());
//! # }
//! ```
//!
//! A migration run:
//! 1. takes the lock, waiting with exponential backoff up to the configured timeout;
//! 2. plans the pending change-sets by comparing the change-log with the ledger;
//! 3. applies each one in change-log order, inside its own transaction unless declared
//!    non-transactional, writing its ledger row in the same transaction;
//! 4. releases the lock, also when the run failed.
//!
//! # Benefits
//! - Checksum drift detection, with per-change-set accepted checksums and
//!   `run_on_change` / `run_always` re-execution.
//! - Preconditions that can halt a run or record a change-set as ran without executing it.
//! - Explicit rollback of the most recently applied change-sets.
//! - Cancellation and a maximum run duration, checked between change-sets.
//! - Observability hooks on every change-set.
//! - Tracing integration - available with the `tracing` feature flag.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//!
//! Other databases can be supported by implementing [Connection].

#[macro_use]
mod macros;

mod core;
pub use core::{
    calculate_checksum, ChangeSet, ChangeSetBuilder, ExecutionMode, Identity,
    PreconditionCheck, PreconditionPolicy, Preconditions,
};

mod error;
pub use error::{Error, Result};

mod connection;
pub use connection::{Connection, Dialect, Row, Transaction, Value};

mod cancel;
pub use cancel::CancellationToken;

mod history;
pub use history::{AppliedRecord, AppliedState, HistoryStore, Outcome};

mod lock;
pub use lock::{LockHandle, LockInfo, LockManager, LockSettings};

mod source;
pub use source::{DescriptorSource, EmbeddedSource, FileSource, ProgrammaticSource};

mod registry;
pub use registry::Registry;

mod planner;
pub use planner::{MigrationPlan, PlanReason, PlannedChangeSet, Planner};

mod executor;
pub use executor::{
    ChangeSetResult, ChangeSetState, ExecutionContext, ExecutionReport, Executor, Hooks,
    RollbackReport,
};

mod config;
pub use config::EngineConfig;

mod migrator;
pub use migrator::{Drift, Migrator, ValidationReport};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
