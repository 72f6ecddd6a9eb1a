//! Command-line argument definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "changeledger")]
#[command(about = "Apply and track database change-sets", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Database to migrate: `sqlite://<path>`, `sqlite::memory:` or `postgres://...`
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Root change-log file
    #[arg(short, long, env = "CHANGELEDGER_CHANGELOG", global = true)]
    pub changelog: Option<PathBuf>,

    /// Engine configuration file (YAML)
    #[arg(long, env = "CHANGELEDGER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Active context; repeat for several. Replaces the contexts from the config file.
    #[arg(long = "context", global = true)]
    pub contexts: Vec<String>,

    /// Warn about checksum drift instead of failing
    #[arg(long, global = true)]
    pub accept_drift: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the change-sets that `migrate` would apply
    Status,

    /// Apply every pending change-set
    Migrate,

    /// Show the ledger, oldest first
    History,

    /// Undo the most recently applied change-sets
    Rollback(RollbackArgs),

    /// Forcibly remove the migration lock
    ReleaseLocks,

    /// Compare the change-log with the ledger without applying anything
    Validate,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Number of change-sets to undo
    #[arg(long, default_value_t = 1)]
    pub count: usize,
}

impl Commands {
    /// Whether the command needs the change-log to be loaded.
    pub fn needs_changelog(&self) -> bool {
        !matches!(self, Commands::ReleaseLocks)
    }
}
