//! Error types for the plugin registry
//!
//! Each layer has its own enum; [`RegistryError`] composes them for the
//! public registry surface.

use std::path::PathBuf;

use crate::export::SymbolKind;

/// Descriptor file read/decode errors
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML descriptor: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Duplicate plugin id: {0}")]
    DuplicateId(String),

    #[error("Descriptor #{index} has an empty `{field}` field")]
    MissingField { index: usize, field: &'static str },
}

/// Module open errors
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Module not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to load library {}: {message}", .path.display())]
    Library { path: PathBuf, message: String },

    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Symbol resolution and binding errors
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    #[error("Symbol `{name}` not found in {}", .module.display())]
    NotFound { module: PathBuf, name: String },

    #[error("Symbol `{name}` is a {found}, destination expects a {expected}")]
    KindMismatch {
        name: String,
        expected: SymbolKind,
        found: SymbolKind,
    },

    #[error("Symbol `{name}` has type `{found}`, destination expects `{expected}`")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: String,
    },

    #[error("Symbol `{name}` is not a valid export: {reason}")]
    InvalidExport { name: String, reason: String },
}

/// Open-then-resolve errors for the standalone helpers
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read descriptor file {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: DescriptorError,
    },

    #[error("Failed to load plugin {id}: {source}")]
    Load {
        id: String,
        #[source]
        source: LoadError,
    },

    #[error("Failed to bind plugin {id}: {source}")]
    Symbol {
        id: String,
        #[source]
        source: SymbolError,
    },

    #[error("Plugin item is not configured: {0}")]
    NotConfigured(String),

    #[error("Registry has been closed")]
    Closed,

    #[error("Invalid capability set: {0}")]
    InvalidCapabilitySet(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("{} plugin entries failed: {}", .0.len(), join_failures(.0))]
    Cycle(Vec<EntryFailure>),
}

impl RegistryError {
    /// The plugin id this error is about, if any
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            RegistryError::Load { id, .. }
            | RegistryError::Symbol { id, .. }
            | RegistryError::NotConfigured(id) => Some(id),
            _ => None,
        }
    }
}

/// A single entry's failure inside an aggregate
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct EntryFailure {
    /// Plugin id
    pub id: String,
    /// What went wrong for this id
    #[source]
    pub error: RegistryError,
}

impl EntryFailure {
    pub(crate) fn load(id: &str, source: LoadError) -> Self {
        Self {
            id: id.to_string(),
            error: RegistryError::Load {
                id: id.to_string(),
                source,
            },
        }
    }

    pub(crate) fn symbol(id: &str, source: SymbolError) -> Self {
        Self {
            id: id.to_string(),
            error: RegistryError::Symbol {
                id: id.to_string(),
                source,
            },
        }
    }
}

fn join_failures(failures: &[EntryFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Registry result type
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_lists_every_failure() {
        let err = RegistryError::Cycle(vec![
            EntryFailure::load("a", LoadError::NotFound(PathBuf::from("a.so"))),
            EntryFailure::symbol(
                "b",
                SymbolError::NotFound {
                    module: PathBuf::from("b.so"),
                    name: "Add".to_string(),
                },
            ),
        ]);

        let msg = err.to_string();
        assert!(msg.starts_with("2 plugin entries failed"));
        assert!(msg.contains("a.so"));
        assert!(msg.contains("`Add`"));
    }

    #[test]
    fn test_plugin_id() {
        assert_eq!(
            RegistryError::NotConfigured("x".to_string()).plugin_id(),
            Some("x")
        );
        assert_eq!(RegistryError::Closed.plugin_id(), None);
    }
}
