//! Plugin descriptors
//!
//! The descriptor file is a list of entries naming which module and symbol
//! to load under a stable id. JSON by default, YAML for `.yaml`/`.yml` files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// One configured plugin entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Module path
    pub file: PathBuf,
    /// Stable unique key across reloads
    pub id: String,
    /// Symbol name inside the module
    pub name: String,
    /// Informational version
    #[serde(default)]
    pub version: String,
    /// Optional hex SHA-256 of the module file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl PluginDescriptor {
    /// Create a descriptor
    pub fn new<P: AsRef<Path>>(id: &str, file: P, name: &str) -> Self {
        Self {
            file: file.as_ref().to_path_buf(),
            id: id.to_string(),
            name: name.to_string(),
            version: String::new(),
            sha256: None,
        }
    }

    /// Set version
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Set expected module checksum
    pub fn with_sha256(mut self, sha256: &str) -> Self {
        self.sha256 = Some(sha256.to_string());
        self
    }
}

/// Descriptor file encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorFormat {
    Json,
    Yaml,
}

impl DescriptorFormat {
    /// Pick the format from the file extension
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                DescriptorFormat::Yaml
            }
            _ => DescriptorFormat::Json,
        }
    }
}

/// Decode and validate a descriptor list
pub fn parse_descriptors(
    text: &str,
    format: DescriptorFormat,
) -> Result<Vec<PluginDescriptor>, DescriptorError> {
    let descriptors: Vec<PluginDescriptor> = match format {
        DescriptorFormat::Json => serde_json::from_str(text)?,
        DescriptorFormat::Yaml => serde_yaml::from_str(text)?,
    };
    validate(&descriptors)?;
    Ok(descriptors)
}

/// Read, decode and validate the descriptor file at `path`
pub fn load_descriptors(path: &Path) -> Result<Vec<PluginDescriptor>, DescriptorError> {
    let text = std::fs::read_to_string(path)?;
    parse_descriptors(&text, DescriptorFormat::from_path(path))
}

fn validate(descriptors: &[PluginDescriptor]) -> Result<(), DescriptorError> {
    let mut seen = HashSet::with_capacity(descriptors.len());
    for (index, d) in descriptors.iter().enumerate() {
        if d.id.is_empty() {
            return Err(DescriptorError::MissingField { index, field: "id" });
        }
        if d.name.is_empty() {
            return Err(DescriptorError::MissingField {
                index,
                field: "name",
            });
        }
        if d.file.as_os_str().is_empty() {
            return Err(DescriptorError::MissingField {
                index,
                field: "file",
            });
        }
        if !seen.insert(d.id.as_str()) {
            return Err(DescriptorError::DuplicateId(d.id.clone()));
        }
    }
    Ok(())
}
