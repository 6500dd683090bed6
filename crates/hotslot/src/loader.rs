//! Module loader
//!
//! Opens plugin modules and resolves exported symbols inside them. The
//! [`NativeLoader`] loads shared libraries; the [`MemoryLoader`] serves
//! modules assembled in-process (statically linked plugins, tests).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{LoadError, SymbolError};
use crate::export::{ExportRecord, SymbolKind};
use crate::symbol::{RawExport, Symbol};

/// An open module
pub trait Module: Send + Sync + 'static {
    /// Path the module was opened from
    fn path(&self) -> &Path;

    /// Resolve an exported symbol by name
    fn export(&self, name: &str) -> Result<RawExport, SymbolError>;
}

/// Opens modules by path
pub trait ModuleLoader: Send + Sync {
    /// Open the module at `path`.
    ///
    /// Every call opens the module again; callers cache handles themselves.
    fn open(&self, path: &Path) -> Result<ModuleHandle, LoadError>;
}

/// Shared owner of an open module
///
/// Symbols and bound values hold a handle too. Native libraries stay mapped
/// for the rest of the process once opened, so values copied out of a
/// module never dangle.
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<dyn Module>,
}

impl ModuleHandle {
    /// Wrap an open module
    pub fn new<M: Module>(module: M) -> Self {
        Self {
            inner: Arc::new(module),
        }
    }

    /// Wrap a shared module
    pub fn from_arc(module: Arc<dyn Module>) -> Self {
        Self { inner: module }
    }

    /// Module path
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Resolve `name` inside this module
    pub fn lookup(&self, name: &str) -> Result<Symbol, SymbolError> {
        debug!("Looking up symbol `{}` in {:?}", name, self.path());
        let export = self.inner.export(name)?;
        Ok(Symbol::new(name, export, self.clone()))
    }

    /// Whether both handles refer to the same open module
    pub fn same_module(&self, other: &ModuleHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleHandle").field(&self.path()).finish()
    }
}

// ============================================================================
// Native modules
// ============================================================================

/// A shared library opened with `libloading`
///
/// The library is never closed: function pointers and `&'static` data copied
/// out of it may outlive every handle.
pub struct NativeModule {
    path: PathBuf,
    library: ManuallyDrop<Library>,
}

impl Module for NativeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn export(&self, name: &str) -> Result<RawExport, SymbolError> {
        // SAFETY: exported symbols are `ExportRecord` statics by contract.
        let record = unsafe {
            let symbol: libloading::Symbol<*const ExportRecord> = self
                .library
                .get(name.as_bytes())
                .map_err(|_| SymbolError::NotFound {
                    module: self.path.clone(),
                    name: name.to_string(),
                })?;
            (*symbol).as_ref()
        };

        let record = record.ok_or_else(|| SymbolError::InvalidExport {
            name: name.to_string(),
            reason: "symbol resolved to a null address".to_string(),
        })?;

        RawExport::from_record(name, record)
    }
}

impl Drop for NativeModule {
    fn drop(&mut self) {
        debug!("Releasing module handle, library stays resident: {:?}", self.path);
    }
}

/// Loader for native shared libraries
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl NativeLoader {
    /// Create a new native loader
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for NativeLoader {
    fn open(&self, path: &Path) -> Result<ModuleHandle, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        info!("Loading module library: {:?}", path);

        // SAFETY: loading a library runs its initializers; plugins are trusted code.
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::Library {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(ModuleHandle::new(NativeModule {
            path: path.to_path_buf(),
            library: ManuallyDrop::new(library),
        }))
    }
}

// ============================================================================
// In-memory modules
// ============================================================================

enum ExportStorage {
    Owned(Box<dyn Any + Send + Sync>),
    Static(&'static ExportRecord),
}

/// An export held by a [`MemoryModule`]
pub struct MemoryExport {
    kind: SymbolKind,
    type_id: TypeId,
    type_name: &'static str,
    capabilities: Vec<String>,
    storage: ExportStorage,
}

impl MemoryExport {
    /// Export a function pointer
    pub fn function<F: Any + Send + Sync>(f: F) -> Self {
        Self::owned(SymbolKind::Function, f)
    }

    /// Export a plain value
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::owned(SymbolKind::Value, value)
    }

    /// Serve a record generated by [`export_fn!`](crate::export_fn) or
    /// [`export_value!`](crate::export_value) in a statically linked plugin
    pub fn from_record(record: &'static ExportRecord) -> Self {
        Self {
            kind: record.kind,
            type_id: (record.type_id)(),
            type_name: record.type_name,
            capabilities: record.capabilities.iter().map(|c| c.to_string()).collect(),
            storage: ExportStorage::Static(record),
        }
    }

    /// Declare a capability
    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capabilities.push(capability.to_string());
        self
    }

    fn owned<T: Any + Send + Sync>(kind: SymbolKind, value: T) -> Self {
        Self {
            kind,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            capabilities: Vec::new(),
            storage: ExportStorage::Owned(Box::new(value)),
        }
    }

    fn raw(&self, name: &str) -> Result<RawExport, SymbolError> {
        match &self.storage {
            ExportStorage::Static(record) => {
                let mut raw = RawExport::from_record(name, record)?;
                raw.capabilities = self.capabilities.clone();
                Ok(raw)
            }
            ExportStorage::Owned(value) => Ok(RawExport {
                kind: self.kind,
                type_id: self.type_id,
                type_name: self.type_name.to_string(),
                capabilities: self.capabilities.clone(),
                value: &**value as *const (dyn Any + Send + Sync) as *const (),
            }),
        }
    }
}

/// A module assembled in-process
pub struct MemoryModule {
    path: PathBuf,
    exports: HashMap<String, MemoryExport>,
}

impl MemoryModule {
    /// Create an empty module served under `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            exports: HashMap::new(),
        }
    }

    /// Add an export
    pub fn with_export(mut self, name: &str, export: MemoryExport) -> Self {
        self.exports.insert(name.to_string(), export);
        self
    }

    /// Add a function export
    pub fn with_function<F: Any + Send + Sync>(self, name: &str, f: F) -> Self {
        self.with_export(name, MemoryExport::function(f))
    }

    /// Add a value export
    pub fn with_value<T: Any + Send + Sync>(self, name: &str, value: T) -> Self {
        self.with_export(name, MemoryExport::value(value))
    }

    /// Exported names
    pub fn names(&self) -> Vec<&str> {
        self.exports.keys().map(|k| k.as_str()).collect()
    }
}

impl Module for MemoryModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn export(&self, name: &str) -> Result<RawExport, SymbolError> {
        self.exports
            .get(name)
            .ok_or_else(|| SymbolError::NotFound {
                module: self.path.clone(),
                name: name.to_string(),
            })?
            .raw(name)
    }
}

/// Loader serving [`MemoryModule`]s by path
#[derive(Default)]
pub struct MemoryLoader {
    modules: RwLock<HashMap<PathBuf, Arc<MemoryModule>>>,
}

impl MemoryLoader {
    /// Create an empty loader
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a module under its path
    pub fn insert(&self, module: MemoryModule) {
        let path = module.path.clone();
        debug!("Registering in-memory module: {:?}", path);
        self.modules.write().insert(path, Arc::new(module));
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn with_module(self, module: MemoryModule) -> Self {
        self.insert(module);
        self
    }

    /// Remove a module; later opens of its path fail
    pub fn remove<P: AsRef<Path>>(&self, path: P) -> bool {
        self.modules.write().remove(path.as_ref()).is_some()
    }

    /// Registered module paths
    pub fn paths(&self) -> Vec<PathBuf> {
        self.modules.read().keys().cloned().collect()
    }
}

impl ModuleLoader for MemoryLoader {
    fn open(&self, path: &Path) -> Result<ModuleHandle, LoadError> {
        let module = self
            .modules
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(path.to_path_buf()))?;

        Ok(ModuleHandle::from_arc(module))
    }
}

// ============================================================================
// Checksums
// ============================================================================

/// Hex SHA-256 of a file
pub fn file_sha256(path: &Path) -> Result<String, LoadError> {
    let contents = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fail unless the file at `path` hashes to `expected` (hex, any case)
pub fn verify_checksum(path: &Path, expected: &str) -> Result<(), LoadError> {
    let actual = file_sha256(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(LoadError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(x: i32, y: i32) -> i32 {
        x + y
    }

    #[test]
    fn test_native_loader_missing_file() {
        let err = NativeLoader::new()
            .open(Path::new("/nonexistent/plugin1.so"))
            .unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn test_native_loader_rejects_non_library() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("not_a_module.so");
        std::fs::write(&file_path, b"definitely not ELF").unwrap();

        let err = NativeLoader::new().open(&file_path).unwrap_err();
        match err {
            LoadError::Library { path, message } => {
                assert_eq!(path, file_path);
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_calculate_hash() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test.txt");
        std::fs::write(&file_path, b"test content").unwrap();

        let hash1 = file_sha256(&file_path).unwrap();
        let hash2 = file_sha256(&file_path).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert!(verify_checksum(&file_path, &hash1.to_uppercase()).is_ok());
        assert!(matches!(
            verify_checksum(&file_path, "00"),
            Err(LoadError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_memory_loader_lookup() {
        let loader = MemoryLoader::new().with_module(
            MemoryModule::new("m1.so")
                .with_function("Add", add as fn(i32, i32) -> i32)
                .with_value("V", 7_i32),
        );

        let handle = loader.open(Path::new("m1.so")).unwrap();
        let add_sym = handle.lookup("Add").unwrap();
        assert_eq!(add_sym.kind(), SymbolKind::Function);
        assert!(add_sym.is::<fn(i32, i32) -> i32>());

        let v = handle.lookup("V").unwrap();
        assert_eq!(v.kind(), SymbolKind::Value);
        assert_eq!(*v.downcast::<i32>().unwrap(), 7);

        assert!(matches!(
            handle.lookup("Missing"),
            Err(SymbolError::NotFound { .. })
        ));
        assert!(matches!(
            loader.open(Path::new("m2.so")),
            Err(LoadError::NotFound(_))
        ));
    }

    #[test]
    fn test_same_module() {
        let loader = MemoryLoader::new().with_module(MemoryModule::new("a.so"));
        let a1 = loader.open(Path::new("a.so")).unwrap();
        let a2 = loader.open(Path::new("a.so")).unwrap();
        assert!(a1.same_module(&a2));

        loader.insert(MemoryModule::new("a.so"));
        let a3 = loader.open(Path::new("a.so")).unwrap();
        assert!(!a1.same_module(&a3));
    }

    crate::export_fn!(LoaderTestAdd: fn(i32, i32) -> i32 = add, capabilities = ["Adder"]);

    #[test]
    fn test_memory_export_from_record() {
        let loader = MemoryLoader::new().with_module(
            MemoryModule::new("static.so")
                .with_export("Add", MemoryExport::from_record(&LoaderTestAdd)),
        );

        let sym = loader
            .open(Path::new("static.so"))
            .unwrap()
            .lookup("Add")
            .unwrap();
        assert_eq!(sym.capabilities(), &["Adder".to_string()]);
        let f = sym.downcast::<fn(i32, i32) -> i32>().unwrap();
        assert_eq!((*f)(2, 3), 5);
    }
}
