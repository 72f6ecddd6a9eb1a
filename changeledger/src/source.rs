//! Where change-set descriptors come from.
//!
//! A [DescriptorSource] produces an ordered list of [ChangeSet]s. Three sources are
//! provided: YAML change-logs on disk ([FileSource]), YAML text compiled into the
//! binary ([EmbeddedSource]) and change-sets built in code ([ProgrammaticSource]).
//!
//! # Change-log format
//!
//! ```yaml
//! changelog:
//!   - include: tables/users.yaml
//!   - change_set:
//!       id: add-email
//!       author: alice
//!       description: Add an email column
//!       sql: ALTER TABLE users ADD COLUMN email TEXT
//!       rollback: ALTER TABLE users DROP COLUMN email
//! ```
//!
//! `sql` and `rollback` take a single statement or a list. Other change-set fields are
//! `execution` (`transactional` / `non_transactional`), `run_always`, `run_on_change`,
//! `fail_on_error`, `contexts`, `preconditions` and `accepted_checksums`. Unknown fields
//! are rejected.

use crate::core::{ChangeSet, ExecutionMode, PreconditionCheck, PreconditionPolicy};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// A provider of change-set descriptors.
pub trait DescriptorSource {
    /// A human-readable name for the source, used in error messages.
    fn label(&self) -> &str;

    /// Produce the change-sets in declaration order.
    fn load(&self) -> Result<Vec<ChangeSet>>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChangelogDocument {
    /// Overrides the file's path as the source label of its change-sets.
    #[serde(default)]
    logical_path: Option<String>,
    #[serde(default)]
    changelog: Vec<ChangelogEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChangelogEntry {
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    change_set: Option<ChangeSetDescriptor>,
}

/// A YAML scalar that may be written as a string or a number (`id: 1`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(v) => write!(f, "{}", v),
            Scalar::Integer(v) => write!(f, "{}", v),
            Scalar::Real(v) => write!(f, "{}", v),
            Scalar::Bool(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Statements {
    One(String),
    Many(Vec<String>),
}

impl Statements {
    fn into_vec(self) -> Vec<String> {
        match self {
            Statements::One(statement) => vec![statement],
            Statements::Many(statements) => statements,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChangeSetDescriptor {
    #[serde(default)]
    id: Option<Scalar>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    execution: ExecutionMode,
    #[serde(default)]
    run_always: bool,
    #[serde(default)]
    run_on_change: bool,
    #[serde(default)]
    fail_on_error: Option<bool>,
    #[serde(default)]
    contexts: Vec<String>,
    #[serde(default)]
    preconditions: Option<PreconditionsDescriptor>,
    #[serde(default)]
    sql: Option<Statements>,
    #[serde(default)]
    rollback: Option<Statements>,
    #[serde(default)]
    accepted_checksums: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreconditionsDescriptor {
    #[serde(default)]
    on_fail: PreconditionPolicy,
    #[serde(default)]
    checks: Vec<CheckDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CheckDescriptor {
    #[serde(default)]
    table_exists: Option<String>,
    #[serde(default)]
    table_not_exists: Option<String>,
    #[serde(default)]
    sql_check: Option<SqlCheckDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SqlCheckDescriptor {
    sql: String,
    expected: Scalar,
}

fn malformed(source_label: &str, reason: impl Into<String>) -> Error {
    Error::MalformedDescriptor {
        source_label: source_label.to_string(),
        reason: reason.into(),
    }
}

fn parse_document(source_label: &str, contents: &str) -> Result<ChangelogDocument> {
    if contents.trim().is_empty() {
        return Ok(ChangelogDocument {
            logical_path: None,
            changelog: Vec::new(),
        });
    }
    serde_yaml::from_str(contents)
        .map_err(|e| malformed(source_label, format!("failed to parse change-log YAML: {}", e)))
}

fn required(source_label: &str, field: &str, value: Option<String>, index: usize) -> Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(malformed(
            source_label,
            format!("change-set #{} is missing '{}'", index + 1, field),
        )),
    }
}

fn build_change_set(
    source_label: &str,
    index: usize,
    descriptor: ChangeSetDescriptor,
) -> Result<ChangeSet> {
    let id = required(
        source_label,
        "id",
        descriptor.id.map(|id| id.to_string()),
        index,
    )?;
    let author = required(source_label, "author", descriptor.author, index)?;

    let mut builder = ChangeSet::builder(author, id)
        .source_label(source_label)
        .execution(descriptor.execution)
        .run_always(descriptor.run_always)
        .run_on_change(descriptor.run_on_change)
        .fail_on_error(descriptor.fail_on_error.unwrap_or(true))
        .sql_all(descriptor.sql.map(Statements::into_vec).unwrap_or_default())
        .rollback_all(
            descriptor
                .rollback
                .map(Statements::into_vec)
                .unwrap_or_default(),
        );

    if let Some(description) = descriptor.description {
        builder = builder.description(description);
    }
    for context in descriptor.contexts {
        builder = builder.context(context);
    }
    for checksum in descriptor.accepted_checksums {
        builder = builder.accept_checksum(checksum);
    }
    if let Some(preconditions) = descriptor.preconditions {
        builder = builder.on_precondition_fail(preconditions.on_fail);
        for check in preconditions.checks {
            builder = builder.precondition(build_check(source_label, index, check)?);
        }
    }

    Ok(builder.build())
}

fn build_check(source_label: &str, index: usize, check: CheckDescriptor) -> Result<PreconditionCheck> {
    match (check.table_exists, check.table_not_exists, check.sql_check) {
        (Some(table), None, None) => Ok(PreconditionCheck::TableExists(table)),
        (None, Some(table), None) => Ok(PreconditionCheck::TableNotExists(table)),
        (None, None, Some(sql_check)) => Ok(PreconditionCheck::SqlCheck {
            sql: sql_check.sql,
            expected: sql_check.expected.to_string(),
        }),
        _ => Err(malformed(
            source_label,
            format!(
                "change-set #{} has a precondition check that does not name exactly one of \
                 table_exists, table_not_exists or sql_check",
                index + 1
            ),
        )),
    }
}

/// The entries of a parsed document, in order.
enum Item {
    Include(String),
    ChangeSet(ChangeSetDescriptor),
}

fn items(source_label: &str, document: ChangelogDocument) -> Result<Vec<Item>> {
    document
        .changelog
        .into_iter()
        .enumerate()
        .map(|(index, entry)| match (entry.include, entry.change_set) {
            (Some(include), None) => Ok(Item::Include(include)),
            (None, Some(change_set)) => Ok(Item::ChangeSet(change_set)),
            _ => Err(malformed(
                source_label,
                format!(
                    "change-log entry #{} must contain exactly one of 'include' or 'change_set'",
                    index + 1
                ),
            )),
        })
        .collect()
}

/// A YAML change-log on disk. `include` entries are resolved relative to the file that
/// contains them.
///
/// Change-sets are labelled with their file's path relative to the root change-log's
/// directory (e.g. `tables/users.yaml`), unless the file sets `logical_path`. Keep the
/// layout stable: the label is part of every change-set's identity.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    label: String,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path.display().to_string();
        Self { path, label }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn canonical(&self, path: &Path) -> Result<PathBuf> {
        path.canonicalize().map_err(|e| {
            malformed(
                &self.label,
                format!("cannot read change-log '{}': {}", path.display(), e),
            )
        })
    }

    fn load_file(
        &self,
        root_dir: &Path,
        path: &Path,
        stack: &mut Vec<PathBuf>,
        out: &mut Vec<ChangeSet>,
    ) -> Result<()> {
        let canonical = self.canonical(path)?;
        if stack.contains(&canonical) {
            return Err(malformed(
                &self.label,
                format!("include cycle detected at '{}'", path.display()),
            ));
        }

        let relative_label = relative_label(root_dir, &canonical);
        let contents = std::fs::read_to_string(&canonical).map_err(|e| {
            malformed(
                &relative_label,
                format!("cannot read change-log '{}': {}", canonical.display(), e),
            )
        })?;
        let document = parse_document(&relative_label, &contents)?;
        let source_label = document
            .logical_path
            .clone()
            .unwrap_or(relative_label);

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %canonical.display(), source_label = %source_label, "Loading change-log");

        let dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root_dir.to_path_buf());

        stack.push(canonical);
        let mut index = 0;
        for item in items(&source_label, document)? {
            match item {
                Item::Include(include) => {
                    self.load_file(root_dir, &dir.join(include), stack, out)?;
                }
                Item::ChangeSet(descriptor) => {
                    out.push(build_change_set(&source_label, index, descriptor)?);
                    index += 1;
                }
            }
        }
        stack.pop();
        Ok(())
    }
}

fn relative_label(root_dir: &Path, file: &Path) -> String {
    file.strip_prefix(root_dir)
        .unwrap_or(file)
        .to_string_lossy()
        .replace('\\', "/")
}

impl DescriptorSource for FileSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<Vec<ChangeSet>> {
        let root = self.canonical(&self.path)?;
        let root_dir = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut change_sets = Vec::new();
        self.load_file(&root_dir, &root, &mut Vec::new(), &mut change_sets)?;
        Ok(change_sets)
    }
}

/// A YAML change-log compiled into the binary, typically with `include_str!`.
///
/// Embedded change-logs are self-contained: `include` entries are rejected.
///
/// ```
/// use changeledger::{DescriptorSource, EmbeddedSource};
///
/// let source = EmbeddedSource::new(
///     "app.yaml",
///     r#"
/// changelog:
///   - change_set:
///       id: 1
///       author: alice
///       sql: CREATE TABLE users (id INTEGER PRIMARY KEY)
/// "#,
/// );
/// let change_sets = source.load().unwrap();
/// assert_eq!(change_sets[0].identity().to_string(), "app.yaml::1::alice");
/// ```
#[derive(Debug, Clone)]
pub struct EmbeddedSource {
    label: String,
    contents: String,
}

impl EmbeddedSource {
    pub fn new(label: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            contents: contents.into(),
        }
    }
}

impl DescriptorSource for EmbeddedSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<Vec<ChangeSet>> {
        let document = parse_document(&self.label, &self.contents)?;
        let source_label = document
            .logical_path
            .clone()
            .unwrap_or_else(|| self.label.clone());

        let mut change_sets = Vec::new();
        for item in items(&source_label, document)? {
            match item {
                Item::Include(include) => {
                    return Err(malformed(
                        &source_label,
                        format!(
                            "embedded change-logs cannot include other files (found '{}')",
                            include
                        ),
                    ));
                }
                Item::ChangeSet(descriptor) => {
                    let index = change_sets.len();
                    change_sets.push(build_change_set(&source_label, index, descriptor)?);
                }
            }
        }
        Ok(change_sets)
    }
}

/// Change-sets defined in code. Change-sets built without a source label get this
/// source's label.
#[derive(Debug, Clone)]
pub struct ProgrammaticSource {
    label: String,
    change_sets: Vec<ChangeSet>,
}

impl ProgrammaticSource {
    pub fn new(label: impl Into<String>, change_sets: Vec<ChangeSet>) -> Self {
        Self {
            label: label.into(),
            change_sets,
        }
    }
}

impl DescriptorSource for ProgrammaticSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<Vec<ChangeSet>> {
        Ok(self
            .change_sets
            .iter()
            .map(|change_set| {
                if change_set.source_label().is_empty() {
                    change_set.clone().with_source_label(&self.label)
                } else {
                    change_set.clone()
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_every_change_set_field() {
        let source = EmbeddedSource::new(
            "main.yaml",
            r#"
changelog:
  - change_set:
      id: create-users
      author: alice
      description: Create users table
      execution: non_transactional
      run_always: true
      run_on_change: true
      fail_on_error: false
      contexts: [dev, test]
      preconditions:
        on_fail: mark_ran
        checks:
          - table_not_exists: users
          - table_exists: accounts
          - sql_check: { sql: "SELECT COUNT(*) FROM accounts", expected: 0 }
      sql:
        - CREATE TABLE users (id INTEGER PRIMARY KEY)
        - CREATE INDEX users_id ON users (id)
      rollback: DROP TABLE users
      accepted_checksums: [abc]
"#,
        );
        let change_sets = source.load().unwrap();
        assert_eq!(change_sets.len(), 1);
        let cs = &change_sets[0];
        assert_eq!(cs.id(), "create-users");
        assert_eq!(cs.author(), "alice");
        assert_eq!(cs.source_label(), "main.yaml");
        assert_eq!(cs.description(), Some("Create users table"));
        assert_eq!(cs.execution(), ExecutionMode::NonTransactional);
        assert!(cs.run_always());
        assert!(cs.run_on_change());
        assert!(!cs.fail_on_error());
        assert_eq!(cs.contexts(), ["dev".to_string(), "test".to_string()]);
        assert_eq!(cs.operations().len(), 2);
        assert_eq!(cs.rollback_operations(), ["DROP TABLE users".to_string()]);
        assert!(cs.accepts_checksum("abc"));

        let preconditions = cs.preconditions();
        assert_eq!(preconditions.on_fail, PreconditionPolicy::MarkRan);
        assert_eq!(
            preconditions.checks,
            vec![
                PreconditionCheck::TableNotExists("users".to_string()),
                PreconditionCheck::TableExists("accounts".to_string()),
                PreconditionCheck::SqlCheck {
                    sql: "SELECT COUNT(*) FROM accounts".to_string(),
                    expected: "0".to_string(),
                },
            ]
        );
    }

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let source = EmbeddedSource::new(
            "main.yaml",
            "changelog:\n  - change_set: { id: 7, author: bob, sql: SELECT 1 }\n",
        );
        let cs = &source.load().unwrap()[0];
        assert_eq!(cs.id(), "7");
        assert_eq!(cs.execution(), ExecutionMode::Transactional);
        assert!(cs.fail_on_error());
        assert!(!cs.run_always());
        assert!(cs.preconditions().is_empty());
    }

    #[test]
    fn missing_author_is_malformed() {
        let source = EmbeddedSource::new(
            "main.yaml",
            "changelog:\n  - change_set: { id: a, sql: SELECT 1 }\n",
        );
        match source.load() {
            Err(Error::MalformedDescriptor {
                source_label,
                reason,
            }) => {
                assert_eq!(source_label, "main.yaml");
                assert!(reason.contains("author"), "{reason}");
            }
            other => panic!("expected malformed descriptor, got {:?}", other),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let source = EmbeddedSource::new(
            "main.yaml",
            "changelog:\n  - change_set: { id: a, author: b, sql: SELECT 1, colour: red }\n",
        );
        assert!(matches!(
            source.load(),
            Err(Error::MalformedDescriptor { .. })
        ));
    }

    #[test]
    fn entry_must_be_include_or_change_set() {
        let source = EmbeddedSource::new(
            "main.yaml",
            "changelog:\n  - include: a.yaml\n    change_set: { id: a, author: b, sql: SELECT 1 }\n",
        );
        assert!(matches!(
            source.load(),
            Err(Error::MalformedDescriptor { .. })
        ));
    }

    #[test]
    fn embedded_source_rejects_includes() {
        let source = EmbeddedSource::new("main.yaml", "changelog:\n  - include: other.yaml\n");
        assert!(matches!(
            source.load(),
            Err(Error::MalformedDescriptor { .. })
        ));
    }

    #[test]
    fn file_source_follows_includes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(
            dir.path(),
            "master.yaml",
            r#"
changelog:
  - change_set: { id: "1", author: alice, sql: CREATE TABLE a (id INTEGER) }
  - include: tables/users.yaml
  - change_set: { id: "3", author: alice, sql: CREATE TABLE c (id INTEGER) }
"#,
        );
        write(
            dir.path(),
            "tables/users.yaml",
            "changelog:\n  - change_set: { id: \"2\", author: bob, sql: CREATE TABLE users (id INTEGER) }\n",
        );

        let change_sets = FileSource::new(&root).load().unwrap();
        let identities: Vec<String> = change_sets
            .iter()
            .map(|cs| cs.identity().to_string())
            .collect();
        assert_eq!(
            identities,
            vec![
                "master.yaml::1::alice",
                "tables/users.yaml::2::bob",
                "master.yaml::3::alice",
            ]
        );
    }

    #[test]
    fn logical_path_overrides_the_label() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(
            dir.path(),
            "master.yaml",
            "logical_path: db/changelog.yaml\nchangelog:\n  - change_set: { id: a, author: b, sql: SELECT 1 }\n",
        );
        let change_sets = FileSource::new(&root).load().unwrap();
        assert_eq!(change_sets[0].source_label(), "db/changelog.yaml");
    }

    #[test]
    fn include_cycles_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "a.yaml", "changelog:\n  - include: b.yaml\n");
        write(dir.path(), "b.yaml", "changelog:\n  - include: a.yaml\n");

        match FileSource::new(&root).load() {
            Err(Error::MalformedDescriptor { reason, .. }) => {
                assert!(reason.contains("cycle"), "{reason}");
            }
            other => panic!("expected include cycle error, got {:?}", other),
        }
    }

    #[test]
    fn missing_file_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileSource::new(dir.path().join("nope.yaml")).load();
        assert!(matches!(result, Err(Error::MalformedDescriptor { .. })));
    }

    #[test]
    fn programmatic_source_fills_in_missing_labels() {
        let source = ProgrammaticSource::new(
            "code",
            vec![
                ChangeSet::builder("alice", "1").sql("SELECT 1").build(),
                ChangeSet::builder("alice", "2")
                    .source_label("explicit")
                    .sql("SELECT 2")
                    .build(),
            ],
        );
        let change_sets = source.load().unwrap();
        assert_eq!(change_sets[0].source_label(), "code");
        assert_eq!(change_sets[1].source_label(), "explicit");
    }

    #[test]
    fn bundled_demo_change_log_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/changelog/master.yaml");
        let change_sets = FileSource::new(path).load().unwrap();
        assert!(change_sets.len() >= 3);
        assert!(change_sets
            .iter()
            .any(|cs| cs.source_label() == "tables/users.yaml"));
    }
}
