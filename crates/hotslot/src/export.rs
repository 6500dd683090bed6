//! Module-side export ABI
//!
//! A plugin module exports each symbol as a `#[no_mangle]` static
//! [`ExportRecord`] named exactly like the descriptor's `name`. The record
//! carries the symbol's kind, type identity and capabilities, plus a pointer
//! to the exported value. Use [`export_fn!`](crate::export_fn) and
//! [`export_value!`](crate::export_value) instead of writing records by hand.
//!
//! Type identity is compared with [`TypeId`], so host and plugins must be
//! built by the same compiler.

use std::any::TypeId;
use std::fmt;

/// Version of the [`ExportRecord`] layout
pub const EXPORT_ABI_VERSION: u32 = 1;

/// Shape of an exported symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SymbolKind {
    /// A callable (function pointer)
    Function = 0,
    /// A plain value
    Value = 1,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Function => write!(f, "function"),
            SymbolKind::Value => write!(f, "value"),
        }
    }
}

/// Exported symbol record as laid out inside a plugin module
#[repr(C)]
pub struct ExportRecord {
    /// Must equal [`EXPORT_ABI_VERSION`]
    pub abi_version: u32,
    /// Function or value
    pub kind: SymbolKind,
    /// Type identity of the value behind `value`
    pub type_id: fn() -> TypeId,
    /// Human readable type name, for diagnostics
    pub type_name: &'static str,
    /// Capabilities the exported value implements
    pub capabilities: &'static [&'static str],
    /// Pointer to the exported value
    pub value: *const (),
}

// The pointee is an immutable static of a `Sync` type.
unsafe impl Sync for ExportRecord {}

impl fmt::Debug for ExportRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportRecord")
            .field("abi_version", &self.abi_version)
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[doc(hidden)]
pub fn type_id_of<T: ?Sized + 'static>() -> TypeId {
    TypeId::of::<T>()
}

/// Export a function from a plugin module.
///
/// ```rust,ignore
/// fn add(x: i32, y: i32) -> i32 {
///     x + y
/// }
///
/// hotslot::export_fn!(Add: fn(i32, i32) -> i32 = add);
/// hotslot::export_fn!(Greet: fn() -> &'static str = greet, capabilities = ["Greeter"]);
/// ```
#[macro_export]
macro_rules! export_fn {
    ($name:ident : $ty:ty = $value:expr $(, capabilities = [$($cap:expr),* $(,)?])? $(,)?) => {
        $crate::__export_record!(
            $name,
            $ty,
            $value,
            $crate::export::SymbolKind::Function,
            [$($($cap),*)?]
        );
    };
}

/// Export a plain value from a plugin module.
///
/// ```rust,ignore
/// hotslot::export_value!(V: i32 = 42);
/// hotslot::export_value!(Greeter: English = English, capabilities = ["Greeter"]);
/// ```
#[macro_export]
macro_rules! export_value {
    ($name:ident : $ty:ty = $value:expr $(, capabilities = [$($cap:expr),* $(,)?])? $(,)?) => {
        $crate::__export_record!(
            $name,
            $ty,
            $value,
            $crate::export::SymbolKind::Value,
            [$($($cap),*)?]
        );
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __export_record {
    ($name:ident, $ty:ty, $value:expr, $kind:expr, [$($cap:expr),*]) => {
        #[allow(non_upper_case_globals)]
        #[unsafe(no_mangle)]
        pub static $name: $crate::export::ExportRecord = $crate::export::ExportRecord {
            abi_version: $crate::export::EXPORT_ABI_VERSION,
            kind: $kind,
            type_id: $crate::export::type_id_of::<$ty>,
            type_name: ::core::stringify!($ty),
            capabilities: &[$($cap),*],
            value: {
                static VALUE: $ty = $value;
                &VALUE as *const $ty as *const ()
            },
        };
    };
}
