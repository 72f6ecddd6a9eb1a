use crate::connection::Connection;
use crate::core::{ChangeSet, Identity};
use crate::error::{Error, Result};
use crate::history::{AppliedRecord, HistoryStore};
use crate::registry::Registry;
use std::collections::HashMap;

/// Why a change-set is part of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    /// Not in the ledger yet.
    New,
    /// Applied before, but marked `run_always`.
    RunAlways,
    /// Applied before with different content, and marked `run_on_change`.
    RunOnChange,
}

#[derive(Debug, Clone, Copy)]
pub struct PlannedChangeSet<'r> {
    pub change_set: &'r ChangeSet,
    pub reason: PlanReason,
}

/// The change-sets a `migrate` would apply, in registry order.
#[derive(Debug, Clone)]
pub struct MigrationPlan<'r> {
    entries: Vec<PlannedChangeSet<'r>>,
    unexpected: Vec<AppliedRecord>,
    ledger_exists: bool,
}

impl<'r> MigrationPlan<'r> {
    /// Nothing to apply.
    pub fn is_up_to_date(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PlannedChangeSet<'r>] {
        &self.entries
    }

    pub fn identities(&self) -> Vec<&'r Identity> {
        self.entries
            .iter()
            .map(|entry| entry.change_set.identity())
            .collect()
    }

    /// Ledger rows with no matching change-set in the registry. They are reported, not
    /// treated as errors, since a change-log may be split across applications.
    pub fn unexpected(&self) -> &[AppliedRecord] {
        &self.unexpected
    }

    /// Whether the ledger table existed when the plan was computed.
    pub fn ledger_exists(&self) -> bool {
        self.ledger_exists
    }
}

/// Computes the pending change-sets by comparing a registry with the ledger.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    accept_drift: bool,
    contexts: Vec<String>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat checksum drift as applied (logging a warning) instead of failing.
    pub fn with_accept_drift(mut self, accept_drift: bool) -> Self {
        self.accept_drift = accept_drift;
        self
    }

    /// Only plan change-sets that run under these contexts. Empty means all.
    pub fn with_contexts(mut self, contexts: Vec<String>) -> Self {
        self.contexts = contexts;
        self
    }

    /// Compute the plan. Never writes; a missing ledger means everything is pending.
    ///
    /// Fails with [Error::ChecksumMismatch] on the first applied change-set whose content
    /// changed, unless it is `run_on_change`, its old checksum is accepted, or drift is
    /// accepted globally.
    pub fn plan<'r>(
        &self,
        registry: &'r Registry,
        history: &HistoryStore,
        conn: &mut dyn Connection,
    ) -> Result<MigrationPlan<'r>> {
        let ledger_exists = history.exists(conn)?;
        let mut applied: HashMap<Identity, AppliedRecord> = if ledger_exists {
            history
                .list_applied(conn)?
                .into_iter()
                .map(|record| (record.identity.clone(), record))
                .collect()
        } else {
            HashMap::new()
        };

        let mut entries = Vec::new();
        for change_set in registry.iter() {
            let record = applied.remove(change_set.identity());

            // Drift is checked for every applied change-set, whatever the active contexts.
            let reason = match record {
                None => Some(PlanReason::New),
                Some(record) if change_set.accepts_checksum(&record.checksum) => {
                    change_set.run_always().then_some(PlanReason::RunAlways)
                }
                Some(_) if change_set.run_on_change() => Some(PlanReason::RunOnChange),
                Some(record) if self.accept_drift => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        change_set = %change_set.identity(),
                        stored = %record.checksum,
                        current = %change_set.checksum(),
                        "Accepting checksum drift"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = record;
                    change_set.run_always().then_some(PlanReason::RunAlways)
                }
                Some(record) => {
                    return Err(Error::ChecksumMismatch {
                        identity: record.identity,
                        stored: record.checksum,
                        current: change_set.checksum().to_string(),
                    });
                }
            };

            if reason.is_some() && !change_set.matches_contexts(&self.contexts) {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    change_set = %change_set.identity(),
                    contexts = ?change_set.contexts(),
                    "Skipping change-set (no matching context)"
                );
                continue;
            }

            match reason {
                Some(reason) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        change_set = %change_set.identity(),
                        reason = ?reason,
                        "Change-set needs to be applied"
                    );
                    entries.push(PlannedChangeSet { change_set, reason });
                }
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        change_set = %change_set.identity(),
                        "Skipping change-set (already applied)"
                    );
                }
            }
        }

        let mut unexpected: Vec<AppliedRecord> = applied.into_values().collect();
        unexpected.sort_by_key(|record| record.sequence_no);

        #[cfg(feature = "tracing")]
        for record in &unexpected {
            tracing::warn!(
                change_set = %record.identity,
                "Ledger contains a change-set that is not in the registry"
            );
        }

        Ok(MigrationPlan {
            entries,
            unexpected,
            ledger_exists,
        })
    }
}
