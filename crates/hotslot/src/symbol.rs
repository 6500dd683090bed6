//! Resolved symbols
//!
//! A [`Symbol`] is what a module lookup returns: the exported record's
//! metadata plus a pointer to the value, tied to the [`ModuleHandle`] it came
//! from so the module stays mapped while the symbol is alive.

use std::any::TypeId;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::binder::Bindable;
use crate::capability::CapabilitySet;
use crate::error::SymbolError;
use crate::export::{EXPORT_ABI_VERSION, ExportRecord, SymbolKind};
use crate::loader::ModuleHandle;

/// Raw export as produced by a module implementation
#[derive(Clone)]
pub struct RawExport {
    pub(crate) kind: SymbolKind,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: String,
    pub(crate) capabilities: Vec<String>,
    pub(crate) value: *const (),
}

// `value` points into module memory that is immutable for the module's lifetime.
unsafe impl Send for RawExport {}
unsafe impl Sync for RawExport {}

impl RawExport {
    /// Validate and copy an [`ExportRecord`]
    pub fn from_record(name: &str, record: &ExportRecord) -> Result<Self, SymbolError> {
        if record.abi_version != EXPORT_ABI_VERSION {
            return Err(SymbolError::InvalidExport {
                name: name.to_string(),
                reason: format!(
                    "export ABI version {} (expected {})",
                    record.abi_version, EXPORT_ABI_VERSION
                ),
            });
        }
        if record.value.is_null() {
            return Err(SymbolError::InvalidExport {
                name: name.to_string(),
                reason: "null value pointer".to_string(),
            });
        }

        Ok(Self {
            kind: record.kind,
            type_id: (record.type_id)(),
            type_name: record.type_name.to_string(),
            capabilities: record.capabilities.iter().map(|c| c.to_string()).collect(),
            value: record.value,
        })
    }
}

/// A symbol resolved from an open module
#[derive(Clone)]
pub struct Symbol {
    name: Arc<str>,
    export: Arc<RawExport>,
    module: ModuleHandle,
}

impl Symbol {
    pub(crate) fn new(name: &str, export: RawExport, module: ModuleHandle) -> Self {
        Self {
            name: Arc::from(name),
            export: Arc::new(export),
            module,
        }
    }

    /// Symbol name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Function or value
    pub fn kind(&self) -> SymbolKind {
        self.export.kind
    }

    /// Exported type name
    pub fn type_name(&self) -> &str {
        &self.export.type_name
    }

    /// Capabilities declared by the export
    pub fn capabilities(&self) -> &[String] {
        &self.export.capabilities
    }

    /// Whether this symbol declares every capability in `set`
    pub fn satisfies(&self, set: &CapabilitySet) -> bool {
        set.is_satisfied_by(self.capabilities())
    }

    /// The module this symbol was resolved from
    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }

    /// Whether the exported value has type `T`
    pub fn is<T: 'static>(&self) -> bool {
        self.export.type_id == TypeId::of::<T>()
    }

    /// Check shape and type, then copy the value out.
    ///
    /// Kind is checked before type so a function bound into a value slot
    /// reports a kind mismatch rather than a type mismatch.
    pub fn downcast<T: Bindable>(&self) -> Result<Loaded<T>, SymbolError> {
        if self.kind() != T::KIND {
            return Err(SymbolError::KindMismatch {
                name: self.name().to_string(),
                expected: T::KIND,
                found: self.kind(),
            });
        }
        let (type_id, type_name) = T::export_type();
        if self.export.type_id != type_id {
            return Err(SymbolError::TypeMismatch {
                name: self.name().to_string(),
                expected: type_name,
                found: self.type_name().to_string(),
            });
        }

        // SAFETY: the type id matches and the module is kept alive by `self.module`.
        let value = unsafe { T::read_export(self.export.value) };
        Ok(Loaded {
            value,
            origin: self.clone(),
        })
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("type_name", &self.type_name())
            .field("capabilities", &self.capabilities())
            .field("module", &self.module.path())
            .finish()
    }
}

/// A value copied out of a module, keeping that module loaded
#[derive(Clone)]
pub struct Loaded<T> {
    value: T,
    origin: Symbol,
}

impl<T> Loaded<T> {
    /// The symbol the value was copied from
    pub fn symbol(&self) -> &Symbol {
        &self.origin
    }

    /// Borrow the value
    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for Loaded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Loaded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loaded")
            .field("value", &self.value)
            .field("symbol", &self.origin.name())
            .finish()
    }
}
