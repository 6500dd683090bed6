//! Live-reloadable native plugin registry
//!
//! Loads independently compiled modules at runtime, resolves named symbols in
//! them and binds those symbols into caller-owned slots that are swapped in
//! place when the descriptor file points an entry at a new module:
//! - Descriptor files (JSON or YAML) naming module, symbol and stable id
//! - Diffing of descriptor sets into added / changed / removed entries
//! - Typed binding into [`Slot`]s with kind and type checks
//! - A background watcher that rebinds watched slots on change
//! - Capability queries over the catalog
//!
//! Modules export symbols with [`export_fn!`] and [`export_value!`]:
//!
//! ```rust,ignore
//! fn add(x: i32, y: i32) -> i32 { x + y }
//!
//! hotslot::export_fn!(Add: fn(i32, i32) -> i32 = add, capabilities = ["Adder"]);
//! ```

pub mod binder;
pub mod capability;
pub mod config;
pub mod descriptor;
pub mod diff;
pub mod error;
pub mod event;
pub mod export;
pub mod loader;
mod registry;
pub mod symbol;
mod watcher;

pub use binder::{Bindable, Callable, Slot, bind, bind_from_file, load_symbol};
pub use capability::CapabilitySet;
pub use config::{LoadPolicy, RegistryConfig, WatchConfig};
pub use descriptor::{DescriptorFormat, PluginDescriptor, load_descriptors, parse_descriptors};
pub use diff::{DescriptorDiff, diff};
pub use error::{
    DescriptorError, EntryFailure, LoadError, RegistryError, RegistryResult, ResolveError,
    SymbolError,
};
pub use event::{ChangeReport, LoadReport, RegistryEvent};
pub use export::{EXPORT_ABI_VERSION, ExportRecord, SymbolKind};
pub use loader::{
    MemoryExport, MemoryLoader, MemoryModule, Module, ModuleHandle, ModuleLoader, NativeLoader,
    NativeModule,
};
pub use registry::Registry;
pub use symbol::{Loaded, RawExport, Symbol};
