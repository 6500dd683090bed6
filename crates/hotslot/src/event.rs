//! Registry events and reports

use std::path::PathBuf;

use crate::error::{EntryFailure, RegistryError};

/// Event broadcast by a registry
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RegistryEvent {
    /// Initial catalog committed
    Loaded { loaded: Vec<String>, failed: Vec<String> },
    /// Entry added by a change cycle
    Added { id: String, file: PathBuf },
    /// Entry's module replaced by a change cycle
    Changed { id: String, file: PathBuf },
    /// Entry removed by a change cycle
    Removed { id: String },
    /// Watched slot rebound to the new module
    Rebound { id: String },
    /// Entry failed to load or rebind
    EntryFailed { id: String, error: String },
    /// Descriptor re-read failed; state unchanged
    ConfigRejected { error: String },
    /// Change cycle finished
    CycleCompleted {
        added: usize,
        changed: usize,
        removed: usize,
        failed: usize,
    },
    /// Registry closed
    Closed,
}

/// Outcome of `load_config`
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Ids committed to the index
    pub loaded: Vec<String>,
    /// Ids left out, with the reason
    pub failed: Vec<EntryFailure>,
}

impl LoadReport {
    /// Whether every entry loaded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn failures into an aggregate error
    pub fn into_result(self) -> Result<Vec<String>, RegistryError> {
        if self.failed.is_empty() {
            Ok(self.loaded)
        } else {
            Err(RegistryError::Cycle(self.failed))
        }
    }
}

/// Outcome of one change-detection cycle
#[derive(Debug, Default)]
pub struct ChangeReport {
    /// Ids added
    pub added: Vec<String>,
    /// Ids whose module was replaced
    pub changed: Vec<String>,
    /// Ids removed
    pub removed: Vec<String>,
    /// Watched ids whose slot was rebound
    pub rebound: Vec<String>,
    /// Per-id failures; the rest of the cycle still applied
    pub failures: Vec<EntryFailure>,
}

impl ChangeReport {
    /// Whether the cycle changed nothing and nothing failed
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.failures.is_empty()
    }

    /// Turn failures into an aggregate error
    pub fn into_result(self) -> Result<ChangeReport, RegistryError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(RegistryError::Cycle(self.failures))
        }
    }

    pub(crate) fn summary(&self) -> RegistryEvent {
        RegistryEvent::CycleCompleted {
            added: self.added.len(),
            changed: self.changed.len(),
            removed: self.removed.len(),
            failed: self.failures.len(),
        }
    }
}
