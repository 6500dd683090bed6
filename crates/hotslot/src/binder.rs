//! Symbol binder
//!
//! Copies resolved symbols into caller-owned [`Slot`]s. The destination type
//! is a generic parameter, so the expected shape and type are fixed at the
//! call site and checked against the symbol at bind time.

use std::any::TypeId;
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ResolveError, SymbolError};
use crate::export::SymbolKind;
use crate::loader::ModuleLoader;
use crate::symbol::{Loaded, Symbol};

/// A type that can be bound from a module symbol.
///
/// Function pointer types (up to six owned arguments) bind from function
/// exports; everything else binds from value exports. Signatures with
/// reference arguments bind through [`Callable`]. Opt a plugin-defined type
/// in with an empty impl:
///
/// ```rust,ignore
/// #[derive(Clone)]
/// pub struct Limits { pub max: u32 }
///
/// impl hotslot::Bindable for Limits {}
/// ```
pub trait Bindable: Clone + Send + Sync + 'static {
    /// Shape a symbol must have to bind into this type
    const KIND: SymbolKind = SymbolKind::Value;

    /// Type id and name the export must carry
    #[doc(hidden)]
    fn export_type() -> (TypeId, &'static str) {
        (TypeId::of::<Self>(), std::any::type_name::<Self>())
    }

    /// Copy the exported value out of module memory.
    ///
    /// # Safety
    ///
    /// `value` must point at a live value of the type named by
    /// [`export_type`](Self::export_type).
    #[doc(hidden)]
    unsafe fn read_export(value: *const ()) -> Self {
        unsafe { (*(value as *const Self)).clone() }
    }
}

/// Binding for any function pointer type.
///
/// Use it for signatures the plain impls cannot name, such as ones with
/// reference arguments:
///
/// ```rust,ignore
/// let greet: Slot<Callable<fn(&str) -> usize>> = Slot::new();
/// bind(&symbol, &greet)?;
/// let len = (greet.load().unwrap().0)("world");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Callable<F>(pub F);

impl<F: Copy> Callable<F> {
    /// The function pointer
    pub fn get(&self) -> F {
        self.0
    }
}

impl<F> Deref for Callable<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.0
    }
}

impl<F: Copy + Send + Sync + 'static> Bindable for Callable<F> {
    const KIND: SymbolKind = SymbolKind::Function;

    fn export_type() -> (TypeId, &'static str) {
        (TypeId::of::<F>(), std::any::type_name::<F>())
    }

    unsafe fn read_export(value: *const ()) -> Self {
        Callable(unsafe { *(value as *const F) })
    }
}

macro_rules! impl_bindable_fn {
    ($($arg:ident),*) => {
        impl<R: 'static, $($arg: 'static),*> Bindable for fn($($arg),*) -> R {
            const KIND: SymbolKind = SymbolKind::Function;
        }

        impl<R: 'static, $($arg: 'static),*> Bindable for extern "C" fn($($arg),*) -> R {
            const KIND: SymbolKind = SymbolKind::Function;
        }
    };
}

impl_bindable_fn!();
impl_bindable_fn!(A1);
impl_bindable_fn!(A1, A2);
impl_bindable_fn!(A1, A2, A3);
impl_bindable_fn!(A1, A2, A3, A4);
impl_bindable_fn!(A1, A2, A3, A4, A5);
impl_bindable_fn!(A1, A2, A3, A4, A5, A6);

macro_rules! impl_bindable_value {
    ($($ty:ty),* $(,)?) => {
        $(impl Bindable for $ty {})*
    };
}

impl_bindable_value!(
    bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
    &'static str, String,
);

/// Caller-owned destination for a bound symbol
///
/// Share it as `Arc<Slot<T>>` to register it for automatic rebinding. Each
/// rebind replaces the whole bound value at once; readers never observe a
/// partially written value.
pub struct Slot<T> {
    bound: RwLock<Option<Loaded<T>>>,
}

impl<T: Bindable> Slot<T> {
    /// Create an empty slot
    pub fn new() -> Self {
        Self {
            bound: RwLock::new(None),
        }
    }

    /// Create an empty slot ready to be watched
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current value, if bound
    pub fn load(&self) -> Option<Loaded<T>> {
        self.bound.read().clone()
    }

    /// Whether a value has been bound
    pub fn is_bound(&self) -> bool {
        self.bound.read().is_some()
    }

    /// Symbol the current value was bound from
    pub fn symbol(&self) -> Option<Symbol> {
        self.bound.read().as_ref().map(|l| l.symbol().clone())
    }

    /// Unbind, returning the previous value
    pub fn clear(&self) -> Option<Loaded<T>> {
        self.bound.write().take()
    }

    fn store(&self, loaded: Loaded<T>) {
        *self.bound.write() = Some(loaded);
    }
}

impl<T: Bindable> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Bindable + fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("bound", &*self.bound.read())
            .finish()
    }
}

/// Bind `symbol` into `slot`.
///
/// On error the slot keeps its previous value.
pub fn bind<T: Bindable>(symbol: &Symbol, slot: &Slot<T>) -> Result<(), SymbolError> {
    let loaded = symbol.downcast::<T>()?;
    slot.store(loaded);
    debug!("Bound symbol `{}` from {:?}", symbol.name(), symbol.module().path());
    Ok(())
}

/// Open the module at `path` and resolve `name` in it
pub fn load_symbol<P: AsRef<Path>>(
    loader: &dyn ModuleLoader,
    path: P,
    name: &str,
) -> Result<Symbol, ResolveError> {
    let module = loader.open(path.as_ref())?;
    Ok(module.lookup(name)?)
}

/// Open the module at `path` and bind `name` into `slot`.
///
/// If anything fails, the slot is left unchanged.
pub fn bind_from_file<T: Bindable, P: AsRef<Path>>(
    loader: &dyn ModuleLoader,
    path: P,
    name: &str,
    slot: &Slot<T>,
) -> Result<(), ResolveError> {
    let symbol = load_symbol(loader, path, name)?;
    Ok(bind(&symbol, slot)?)
}

/// Type-erased view of a watched slot
pub(crate) trait WatchedSlot: Send + Sync {
    fn rebind(&self, symbol: &Symbol) -> Result<(), SymbolError>;

    fn bound_symbol(&self) -> Option<Symbol>;
}

impl<T: Bindable> WatchedSlot for Slot<T> {
    fn rebind(&self, symbol: &Symbol) -> Result<(), SymbolError> {
        bind(symbol, self)
    }

    fn bound_symbol(&self) -> Option<Symbol> {
        self.symbol()
    }
}

/// Weak back-reference from the registry to a caller's slot
pub(crate) type SlotRef = Weak<dyn WatchedSlot>;

pub(crate) fn slot_ref<T: Bindable>(slot: &Arc<Slot<T>>) -> SlotRef {
    let weak: Weak<Slot<T>> = Arc::downgrade(slot);
    weak
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{MemoryLoader, MemoryModule, ModuleLoader};

    type AddFn = fn(i32, i32) -> i32;

    fn add(x: i32, y: i32) -> i32 {
        x + y
    }

    fn add_one(x: i32, y: i32) -> i32 {
        x + y + 1
    }

    fn loader() -> MemoryLoader {
        MemoryLoader::new()
            .with_module(
                MemoryModule::new("plugin1.so")
                    .with_function("Add", add as AddFn)
                    .with_value("V", 10_i32)
                    .with_value("Name", "plugin1"),
            )
            .with_module(MemoryModule::new("plugin2.so").with_function("Add", add_one as AddFn))
    }

    fn symbol(loader: &MemoryLoader, path: &str, name: &str) -> Symbol {
        loader.open(Path::new(path)).unwrap().lookup(name).unwrap()
    }

    #[test]
    fn test_bind_function() {
        let loader = loader();
        let slot: Slot<AddFn> = Slot::new();
        assert!(!slot.is_bound());

        bind(&symbol(&loader, "plugin1.so", "Add"), &slot).unwrap();
        let f = slot.load().unwrap();
        assert_eq!((*f)(1, 2), 3);
        assert_eq!(f.symbol().name(), "Add");
    }

    #[test]
    fn test_bind_value() {
        let loader = loader();
        let v: Slot<i32> = Slot::new();
        let name: Slot<&'static str> = Slot::new();

        bind(&symbol(&loader, "plugin1.so", "V"), &v).unwrap();
        bind(&symbol(&loader, "plugin1.so", "Name"), &name).unwrap();

        assert_eq!(*v.load().unwrap(), 10);
        assert_eq!(*name.load().unwrap(), "plugin1");
    }

    #[test]
    fn test_kind_mismatch_leaves_slot_unchanged() {
        let loader = loader();
        let v: Slot<i32> = Slot::new();
        bind(&symbol(&loader, "plugin1.so", "V"), &v).unwrap();

        let err = bind(&symbol(&loader, "plugin1.so", "Add"), &v).unwrap_err();
        assert!(matches!(
            err,
            SymbolError::KindMismatch {
                expected: SymbolKind::Value,
                found: SymbolKind::Function,
                ..
            }
        ));
        assert_eq!(*v.load().unwrap(), 10);

        let f: Slot<AddFn> = Slot::new();
        let err = bind(&symbol(&loader, "plugin1.so", "V"), &f).unwrap_err();
        assert!(matches!(err, SymbolError::KindMismatch { .. }));
        assert!(!f.is_bound());
    }

    #[test]
    fn test_type_mismatch_leaves_slot_unchanged() {
        let loader = loader();
        let v: Slot<u64> = Slot::new();
        let err = bind(&symbol(&loader, "plugin1.so", "V"), &v).unwrap_err();
        assert!(matches!(err, SymbolError::TypeMismatch { .. }));
        assert!(v.load().is_none());

        let f: Slot<fn(i64) -> i64> = Slot::new();
        let err = bind(&symbol(&loader, "plugin1.so", "Add"), &f).unwrap_err();
        assert!(matches!(err, SymbolError::TypeMismatch { .. }));
        assert!(!f.is_bound());
    }

    #[test]
    fn test_rebind_through_weak_ref() {
        let loader = loader();
        let slot: Arc<Slot<AddFn>> = Slot::shared();
        let weak = slot_ref(&slot);

        weak.upgrade()
            .unwrap()
            .rebind(&symbol(&loader, "plugin1.so", "Add"))
            .unwrap();
        assert_eq!((*slot.load().unwrap())(1, 2), 3);

        weak.upgrade()
            .unwrap()
            .rebind(&symbol(&loader, "plugin2.so", "Add"))
            .unwrap();
        assert_eq!((*slot.load().unwrap())(1, 2), 4);
        assert_eq!(
            weak.upgrade().unwrap().bound_symbol().unwrap().module().path(),
            Path::new("plugin2.so")
        );

        drop(slot);
        assert!(weak.upgrade().is_none());
    }

    fn name_len(name: &str) -> usize {
        name.len()
    }

    #[test]
    fn test_bind_reference_argument_callable() {
        let loader = MemoryLoader::new().with_module(
            MemoryModule::new("greeter.so").with_function("Greet", name_len as fn(&str) -> usize),
        );
        let greet: Slot<Callable<fn(&str) -> usize>> = Slot::new();

        bind(&symbol(&loader, "greeter.so", "Greet"), &greet).unwrap();
        let f = greet.load().unwrap();
        assert_eq!((f.0)("world"), 5);
        assert_eq!((*f).get()("hi"), 2);
    }

    #[test]
    fn test_callable_checks_kind_and_type() {
        let loader = loader();

        let wrong_kind: Slot<Callable<fn(&str) -> usize>> = Slot::new();
        let err = bind(&symbol(&loader, "plugin1.so", "V"), &wrong_kind).unwrap_err();
        assert!(matches!(err, SymbolError::KindMismatch { .. }));

        let wrong_type: Slot<Callable<fn(&str) -> usize>> = Slot::new();
        let err = bind(&symbol(&loader, "plugin1.so", "Add"), &wrong_type).unwrap_err();
        assert!(matches!(err, SymbolError::TypeMismatch { .. }));
        assert!(!wrong_type.is_bound());

        let same: Slot<Callable<AddFn>> = Slot::new();
        bind(&symbol(&loader, "plugin1.so", "Add"), &same).unwrap();
        assert_eq!((same.load().unwrap().0)(1, 2), 3);
    }

    #[test]
    fn test_bind_from_file() {
        let loader = loader();
        let slot: Slot<AddFn> = Slot::new();

        bind_from_file(&loader, "plugin2.so", "Add", &slot).unwrap();
        assert_eq!((*slot.load().unwrap())(1, 2), 4);

        let err = bind_from_file(&loader, "missing.so", "Add", &slot).unwrap_err();
        assert!(matches!(err, ResolveError::Load(_)));

        let err = load_symbol(&loader, "plugin1.so", "v").unwrap_err();
        assert!(matches!(err, ResolveError::Symbol(SymbolError::NotFound { .. })));
        assert_eq!((*slot.load().unwrap())(1, 2), 4);
    }
}
