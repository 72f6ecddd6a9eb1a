use crate::core::{ChangeSet, Identity};
use crate::error::{Error, Result};
use crate::source::DescriptorSource;
use std::collections::HashSet;

/// The ordered, validated set of change-sets known to the engine.
///
/// Registry order is application order. Identities are unique, and every change-set has
/// a non-empty list of operations that checksums deterministically.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    change_sets: Vec<ChangeSet>,
}

impl Registry {
    /// Load and validate every change-set a source declares.
    pub fn load(source: &dyn DescriptorSource) -> Result<Self> {
        let change_sets = source.load()?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            source = %source.label(),
            change_sets = change_sets.len(),
            "Loaded change-set descriptors"
        );

        Self::from_change_sets(change_sets)
    }

    /// Build a registry from change-sets that are already constructed.
    pub fn from_change_sets(change_sets: Vec<ChangeSet>) -> Result<Self> {
        let mut seen: HashSet<&Identity> = HashSet::new();
        for change_set in &change_sets {
            let identity = change_set.identity();
            for (field, value) in [
                ("author", &identity.author),
                ("id", &identity.id),
                ("source label", &identity.source_label),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::MalformedDescriptor {
                        source_label: identity.source_label.clone(),
                        reason: format!("change-set '{}' has an empty {}", identity, field),
                    });
                }
            }
            if !seen.insert(identity) {
                return Err(Error::MalformedDescriptor {
                    source_label: identity.source_label.clone(),
                    reason: format!("duplicate change-set identity {}", identity),
                });
            }
            Self::validate(change_set)?;
        }
        Ok(Self { change_sets })
    }

    /// Check that a change-set can be checksummed deterministically.
    ///
    /// Fails with [Error::InvalidOperation] for an empty operation list, a blank
    /// operation, or an operation containing a NUL character.
    pub fn validate(change_set: &ChangeSet) -> Result<()> {
        let invalid = |reason: String| Error::InvalidOperation {
            identity: change_set.identity().clone(),
            reason,
        };

        if change_set.operations().is_empty() {
            return Err(invalid("the change-set has no operations".to_string()));
        }
        for (index, operation) in change_set.operations().iter().enumerate() {
            if operation.trim().is_empty() {
                return Err(invalid(format!("operation {} is blank", index)));
            }
            if operation.contains('\0') {
                return Err(invalid(format!(
                    "operation {} contains a NUL character",
                    index
                )));
            }
        }
        Ok(())
    }

    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeSet> {
        self.change_sets.iter()
    }

    pub fn get(&self, identity: &Identity) -> Option<&ChangeSet> {
        self.change_sets
            .iter()
            .find(|change_set| change_set.identity() == identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.get(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{EmbeddedSource, ProgrammaticSource};

    fn cs(id: &str, sql: &str) -> ChangeSet {
        ChangeSet::builder("alice", id)
            .source_label("main.yaml")
            .sql(sql)
            .build()
    }

    #[test]
    fn keeps_declaration_order() {
        let registry =
            Registry::from_change_sets(vec![cs("b", "SELECT 1"), cs("a", "SELECT 2")]).unwrap();
        let ids: Vec<_> = registry.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(registry.contains(&Identity::new("alice", "a", "main.yaml")));
        assert!(!registry.contains(&Identity::new("bob", "a", "main.yaml")));
    }

    #[test]
    fn duplicate_identity_is_malformed() {
        let result = Registry::from_change_sets(vec![cs("a", "SELECT 1"), cs("a", "SELECT 2")]);
        match result {
            Err(Error::MalformedDescriptor { reason, .. }) => {
                assert!(reason.contains("duplicate"), "{reason}");
            }
            other => panic!("expected duplicate identity error, got {:?}", other),
        }
    }

    #[test]
    fn same_id_from_different_authors_is_allowed() {
        let other = ChangeSet::builder("bob", "a")
            .source_label("main.yaml")
            .sql("SELECT 1")
            .build();
        let registry = Registry::from_change_sets(vec![cs("a", "SELECT 1"), other]).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn empty_source_label_is_malformed() {
        let unlabelled = ChangeSet::builder("alice", "a").sql("SELECT 1").build();
        assert!(matches!(
            Registry::from_change_sets(vec![unlabelled]),
            Err(Error::MalformedDescriptor { .. })
        ));
    }

    #[test]
    fn validate_rejects_unstable_operations() {
        let empty = ChangeSet::builder("alice", "a")
            .source_label("main.yaml")
            .build();
        assert!(matches!(
            Registry::validate(&empty),
            Err(Error::InvalidOperation { .. })
        ));
        assert!(matches!(
            Registry::validate(&cs("b", "   ")),
            Err(Error::InvalidOperation { .. })
        ));
        assert!(matches!(
            Registry::validate(&cs("c", "SELECT '\0'")),
            Err(Error::InvalidOperation { .. })
        ));
        Registry::validate(&cs("d", "SELECT 1")).unwrap();
    }

    #[test]
    fn load_validates_every_entry() {
        let source = EmbeddedSource::new(
            "main.yaml",
            "changelog:\n  - change_set: { id: a, author: b, sql: SELECT 1 }\n  - change_set: { id: c, author: b }\n",
        );
        assert!(matches!(
            Registry::load(&source),
            Err(Error::InvalidOperation { .. })
        ));
    }

    #[test]
    fn load_from_programmatic_source() {
        let source = ProgrammaticSource::new(
            "code",
            vec![ChangeSet::builder("alice", "1").sql("SELECT 1").build()],
        );
        let registry = Registry::load(&source).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry
            .get(&Identity::new("alice", "1", "code"))
            .is_some());
    }
}
