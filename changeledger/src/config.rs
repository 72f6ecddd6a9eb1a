use crate::error::{Error, Result};
use crate::history::DEFAULT_LEDGER_TABLE_NAME;
use crate::lock::{LockSettings, DEFAULT_LOCK_TABLE_NAME};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine settings, usually read from a YAML file.
///
/// Every field has a default, so an empty document is a valid configuration.
///
/// ```
/// use changeledger::EngineConfig;
///
/// let config = EngineConfig::from_yaml_str("lock_timeout_ms: 1000\ncontexts: [dev]").unwrap();
/// assert_eq!(config.lock_timeout().as_millis(), 1000);
/// assert_eq!(config.ledger_table, "changeledger_history");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub ledger_table: String,
    pub lock_table: String,
    /// How long `migrate` and `rollback` wait for the lock.
    pub lock_timeout_ms: u64,
    /// Heartbeat age after which a lock is considered abandoned.
    pub lock_staleness_ms: u64,
    pub lock_initial_backoff_ms: u64,
    pub lock_max_backoff_ms: u64,
    /// Maximum duration of one apply run. Unlimited when absent.
    pub max_duration_ms: Option<u64>,
    /// Lock owner id; generated per process when absent.
    pub owner_id: Option<String>,
    pub accept_drift: bool,
    pub contexts: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let lock = LockSettings::default();
        Self {
            ledger_table: DEFAULT_LEDGER_TABLE_NAME.to_string(),
            lock_table: DEFAULT_LOCK_TABLE_NAME.to_string(),
            lock_timeout_ms: 5 * 60 * 1000,
            lock_staleness_ms: lock.staleness.as_millis() as u64,
            lock_initial_backoff_ms: lock.initial_backoff.as_millis() as u64,
            lock_max_backoff_ms: lock.max_backoff.as_millis() as u64,
            max_duration_ms: None,
            owner_id: None,
            accept_drift: false,
            contexts: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&contents).map_err(|e| match e {
            Error::Config(message) => Error::Config(format!("{}: {}", path.display(), message)),
            other => other,
        })
    }

    fn validate(&self) -> Result<()> {
        check_table_name("ledger_table", &self.ledger_table)?;
        check_table_name("lock_table", &self.lock_table)?;
        if self.ledger_table == self.lock_table {
            return Err(Error::Config(
                "ledger_table and lock_table must differ".to_string(),
            ));
        }
        if self.lock_initial_backoff_ms == 0 || self.lock_max_backoff_ms < self.lock_initial_backoff_ms
        {
            return Err(Error::Config(format!(
                "lock backoff must satisfy 0 < initial ({}) <= max ({})",
                self.lock_initial_backoff_ms, self.lock_max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            staleness: Duration::from_millis(self.lock_staleness_ms),
            initial_backoff: Duration::from_millis(self.lock_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.lock_max_backoff_ms),
        }
    }
}

/// Reject a table name that is not a plain SQL identifier.
pub(crate) fn check_table_name(field: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{} must be a plain SQL identifier, found '{}'",
            field, name
        )))
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*` is allowed.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
