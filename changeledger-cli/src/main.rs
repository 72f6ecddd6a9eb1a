//! `changeledger` - apply and track database change-sets from the command line.
//!
//! Exit codes: `0` on success, `2` when a change-set failed, `3` when the migration
//! lock could not be acquired, `4` on checksum drift and `1` for anything else.

use anyhow::{bail, Context, Result};
use changeledger::{Connection, EngineConfig, FileSource, Migrator, PlanReason};
use clap::Parser;
use std::process::ExitCode;

mod cli;

use cli::{Cli, Commands, GlobalArgs};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {:#}", error);
            ExitCode::from(exit_code(&error))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Engine errors keep their own exit code, even when wrapped in context.
fn exit_code(error: &anyhow::Error) -> u8 {
    error
        .downcast_ref::<changeledger::Error>()
        .map(changeledger::Error::exit_code)
        .unwrap_or(1)
}

/// Open a connection for a `--database-url`.
fn connect(url: &str) -> Result<Box<dyn Connection>> {
    if url == "sqlite::memory:" {
        tracing::debug!("Opening in-memory SQLite database");
        return Ok(Box::new(rusqlite::Connection::open_in_memory()?));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        tracing::debug!(path, "Opening SQLite database");
        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database '{}'", path))?;
        changeledger::sqlite::configure(&conn, changeledger::sqlite::DEFAULT_BUSY_TIMEOUT)?;
        return Ok(Box::new(conn));
    }
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        tracing::debug!("Connecting to PostgreSQL");
        let client = postgres::Client::connect(url, postgres::NoTls)
            .context("Failed to connect to PostgreSQL")?;
        return Ok(Box::new(client));
    }
    bail!(
        "Unsupported database URL '{}': expected sqlite://<path>, sqlite::memory: or postgres://...",
        url
    )
}

fn load_config(global: &GlobalArgs) -> Result<EngineConfig> {
    let mut config = match &global.config {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading engine config");
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    };
    if !global.contexts.is_empty() {
        config.contexts = global.contexts.clone();
    }
    config.accept_drift |= global.accept_drift;
    Ok(config)
}

fn build_migrator(cli: &Cli) -> Result<Migrator> {
    let config = load_config(&cli.global)?;
    let migrator = if cli.command.needs_changelog() {
        let path = cli
            .global
            .changelog
            .as_ref()
            .context("No change-log given: pass --changelog or set CHANGELEDGER_CHANGELOG")?;
        Migrator::from_source(&FileSource::new(path))?
    } else {
        Migrator::from_change_sets(Vec::new())?
    };
    Ok(migrator.with_config(&config)?)
}

fn run(cli: &Cli) -> Result<()> {
    let migrator = build_migrator(cli)?;
    let url = cli
        .global
        .database_url
        .as_deref()
        .context("No database given: pass --database-url or set DATABASE_URL")?;
    let mut conn = connect(url)?;
    let conn = &mut *conn;

    match &cli.command {
        Commands::Status => status(&migrator, conn),
        Commands::Migrate => migrate(&migrator, conn),
        Commands::History => history(&migrator, conn),
        Commands::Rollback(args) => rollback(&migrator, conn, args.count),
        Commands::ReleaseLocks => release_locks(&migrator, conn),
        Commands::Validate => validate(&migrator, conn),
    }
}

fn reason_label(reason: PlanReason) -> &'static str {
    match reason {
        PlanReason::New => "new",
        PlanReason::RunAlways => "run-always",
        PlanReason::RunOnChange => "changed",
    }
}

fn status(migrator: &Migrator, conn: &mut dyn Connection) -> Result<()> {
    let plan = migrator.status(conn)?;
    if plan.is_up_to_date() {
        println!("Database is up to date.");
    } else {
        println!("Pending change-sets ({}):", plan.len());
        for entry in plan.entries() {
            println!(
                "  {} [{}]",
                entry.change_set.identity(),
                reason_label(entry.reason)
            );
            if let Some(description) = entry.change_set.description() {
                println!("      {}", description);
            }
        }
    }
    if !plan.unexpected().is_empty() {
        println!("Applied change-sets missing from the change-log:");
        for record in plan.unexpected() {
            println!("  {}", record.identity);
        }
    }
    if let Some(lock) = migrator.lock_status(conn)? {
        println!(
            "Lock held by '{}' since {}",
            lock.owner_id,
            lock.acquired_at.to_rfc3339()
        );
    }
    Ok(())
}

fn migrate(migrator: &Migrator, conn: &mut dyn Connection) -> Result<()> {
    let report = migrator.migrate(conn)?;
    if report.results.is_empty() {
        println!("Database is up to date.");
        return Ok(());
    }
    for result in &report.results {
        let outcome = result
            .outcome
            .map(|outcome| outcome.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:?} ({}, {}ms)",
            result.identity,
            result.state,
            outcome,
            result.duration.as_millis()
        );
    }
    println!(
        "Applied {} change-set(s) in {}ms (deployment {})",
        report.applied,
        report.elapsed.as_millis(),
        report.deployment_id
    );
    Ok(())
}

fn history(migrator: &Migrator, conn: &mut dyn Connection) -> Result<()> {
    let records = migrator.history(conn)?;
    if records.is_empty() {
        println!("No change-sets have been applied.");
        return Ok(());
    }
    println!("Applied change-sets ({}):", records.len());
    for record in records {
        println!(
            "  #{} {} [{}] at {} ({}ms, deployment {})",
            record.sequence_no,
            record.identity,
            record.outcome,
            record.applied_at.to_rfc3339(),
            record.duration.as_millis(),
            record.deployment_id
        );
    }
    Ok(())
}

fn rollback(migrator: &Migrator, conn: &mut dyn Connection, count: usize) -> Result<()> {
    let report = migrator.rollback(conn, count)?;
    if report.rolled_back.is_empty() {
        println!("Nothing to roll back.");
    }
    for identity in &report.rolled_back {
        println!("  rolled back {}", identity);
    }
    Ok(())
}

fn release_locks(migrator: &Migrator, conn: &mut dyn Connection) -> Result<()> {
    if migrator.release_locks(conn)? {
        println!("Migration lock released.");
    } else {
        println!("Migration lock was not held.");
    }
    Ok(())
}

fn validate(migrator: &Migrator, conn: &mut dyn Connection) -> Result<()> {
    let report = migrator.validate(conn)?;
    println!(
        "{} change-set(s), {} pending, {} drifted, {} unexpected",
        report.change_sets,
        report.pending,
        report.drifted.len(),
        report.unexpected.len()
    );
    for drift in &report.drifted {
        println!(
            "  drifted {}: stored {}, current {}",
            drift.identity, drift.stored, drift.current
        );
    }
    report.into_result()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const CHANGELOG: &str = r#"
changelog:
  - change_set:
      id: "1"
      author: alice
      sql: CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)
      rollback: DROP TABLE users
  - change_set:
      id: "2"
      author: alice
      sql: CREATE TABLE posts (id INTEGER PRIMARY KEY)
      rollback: DROP TABLE posts
"#;

    fn cli(dir: &Path, args: &[&str]) -> Cli {
        let db = format!("sqlite://{}", dir.join("app.db").display());
        let changelog = dir.join("changelog.yaml");
        let mut argv = vec![
            "changeledger".to_string(),
            "--database-url".to_string(),
            db,
            "--changelog".to_string(),
            changelog.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    fn workspace(changelog: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("changelog.yaml"), changelog).unwrap();
        dir
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "changeledger",
            "rollback",
            "--count",
            "3",
            "--context",
            "dev",
            "--context",
            "eu",
            "--accept-drift",
        ])
        .unwrap();
        match cli.command {
            Commands::Rollback(args) => assert_eq!(args.count, 3),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.global.contexts, vec!["dev", "eu"]);
        assert!(cli.global.accept_drift);
    }

    #[test]
    fn connects_by_url_scheme() {
        let mut conn = connect("sqlite::memory:").unwrap();
        assert_eq!(conn.dialect(), changeledger::Dialect::Sqlite);
        assert!(!conn.table_exists("users").unwrap());
        assert!(connect("mysql://localhost/db").is_err());
    }

    #[test]
    fn migrate_then_rollback() {
        let dir = workspace(CHANGELOG);
        run(&cli(dir.path(), &["migrate"])).unwrap();
        run(&cli(dir.path(), &["status"])).unwrap();
        run(&cli(dir.path(), &["validate"])).unwrap();

        let mut conn = connect(&format!("sqlite://{}", dir.path().join("app.db").display())).unwrap();
        assert!(conn.table_exists("posts").unwrap());
        drop(conn);

        run(&cli(dir.path(), &["rollback", "--count", "2"])).unwrap();
        let mut conn = connect(&format!("sqlite://{}", dir.path().join("app.db").display())).unwrap();
        assert!(!conn.table_exists("users").unwrap());
    }

    #[test]
    fn drift_exits_with_code_four() {
        let dir = workspace(CHANGELOG);
        run(&cli(dir.path(), &["migrate"])).unwrap();

        std::fs::write(
            dir.path().join("changelog.yaml"),
            CHANGELOG.replace("name TEXT", "name TEXT NOT NULL"),
        )
        .unwrap();
        let error = run(&cli(dir.path(), &["validate"])).unwrap_err();
        assert_eq!(exit_code(&error), 4);

        let error = run(&cli(dir.path(), &["migrate"])).unwrap_err();
        assert_eq!(exit_code(&error), 4);

        run(&cli(dir.path(), &["migrate", "--accept-drift"])).unwrap();
    }

    #[test]
    fn failed_change_set_exits_with_code_two() {
        let dir = workspace(
            r#"
changelog:
  - change_set:
      id: "1"
      author: alice
      sql: INSERT INTO missing VALUES (1)
"#,
        );
        let error = run(&cli(dir.path(), &["migrate"])).unwrap_err();
        assert_eq!(exit_code(&error), 2);
    }

    #[test]
    fn empty_changelog_is_up_to_date() {
        let dir = workspace("changelog: []\n");
        run(&cli(dir.path(), &["status"])).unwrap();
        run(&cli(dir.path(), &["migrate"])).unwrap();
        run(&cli(dir.path(), &["validate"])).unwrap();
    }

    #[test]
    fn release_locks_needs_no_changelog() {
        let dir = tempfile::tempdir().unwrap();
        let db = format!("sqlite://{}", dir.path().join("app.db").display());
        let cli = Cli::try_parse_from(["changeledger", "--database-url", &db, "release-locks"])
            .unwrap();
        run(&cli).unwrap();
    }

    #[test]
    fn missing_database_url_is_reported() {
        let dir = workspace(CHANGELOG);
        let changelog = dir.path().join("changelog.yaml").display().to_string();
        let mut cli = Cli::try_parse_from(["changeledger", "--changelog", &changelog, "status"])
            .unwrap();
        cli.global.database_url = None;
        let error = run(&cli).unwrap_err();
        assert!(error.to_string().contains("DATABASE_URL"));
        assert_eq!(exit_code(&error), 1);
    }
}
