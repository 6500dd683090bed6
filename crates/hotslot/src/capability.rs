//! Capability sets used by capability queries

use std::collections::BTreeSet;

use crate::error::RegistryError;

/// A set of capability names a symbol must declare
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    names: BTreeSet<String>,
}

impl CapabilitySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability
    pub fn with(mut self, capability: &str) -> Self {
        self.names.insert(capability.to_string());
        self
    }

    /// Capability names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// A set is a valid query when it is non-empty and has no blank names
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.names.is_empty() {
            return Err(RegistryError::InvalidCapabilitySet(
                "capability set is empty".to_string(),
            ));
        }
        if let Some(name) = self.names.iter().find(|n| n.trim().is_empty()) {
            return Err(RegistryError::InvalidCapabilitySet(format!(
                "blank capability name {:?}",
                name
            )));
        }
        Ok(())
    }

    /// Whether `declared` contains every capability in this set
    pub fn is_satisfied_by(&self, declared: &[String]) -> bool {
        self.names.iter().all(|n| declared.iter().any(|d| d == n))
    }
}

impl<S: AsRef<str>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }
}
