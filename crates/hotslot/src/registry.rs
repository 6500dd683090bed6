//! Plugin registry
//!
//! Owns the catalog of configured entries (descriptor baseline, id index and
//! watch-set) behind one reader/writer lock. Modules are opened outside the
//! lock and only the resulting handles are swapped in. Change cycles and
//! loads are serialized by a separate cycle lock so the watcher and direct
//! `check_changes` callers never interleave.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binder::{Bindable, Slot, SlotRef, WatchedSlot, bind, slot_ref};
use crate::capability::CapabilitySet;
use crate::config::{LoadPolicy, RegistryConfig};
use crate::descriptor::{PluginDescriptor, load_descriptors};
use crate::diff::diff;
use crate::error::{EntryFailure, LoadError, RegistryError, RegistryResult, SymbolError};
use crate::event::{ChangeReport, LoadReport, RegistryEvent};
use crate::loader::{ModuleHandle, ModuleLoader, NativeLoader, verify_checksum};
use crate::symbol::Symbol;
use crate::watcher::ConfigWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Active,
    Closed,
}

/// One indexed plugin entry
struct Entry {
    descriptor: PluginDescriptor,
    module: ModuleHandle,
    slot: Option<SlotRef>,
}

impl Entry {
    fn watched(&self) -> Option<Arc<dyn WatchedSlot>> {
        self.slot.as_ref().and_then(Weak::upgrade)
    }
}

struct State {
    lifecycle: Lifecycle,
    /// Descriptors currently in effect, in file order
    descriptors: Vec<PluginDescriptor>,
    entries: HashMap<String, Entry>,
}

impl State {
    fn ensure_open(&self) -> RegistryResult<()> {
        if self.lifecycle == Lifecycle::Closed {
            Err(RegistryError::Closed)
        } else {
            Ok(())
        }
    }

    fn entry(&self, id: &str) -> RegistryResult<&Entry> {
        self.ensure_open()?;
        self.entries
            .get(id)
            .ok_or_else(|| RegistryError::NotConfigured(id.to_string()))
    }
}

/// A watched slot to rebind after its entry's module was replaced
struct Rebind {
    id: String,
    name: String,
    module: ModuleHandle,
    slot: SlotRef,
}

impl Rebind {
    /// `Ok(false)` when the caller already dropped the slot
    fn apply(&self) -> Result<bool, SymbolError> {
        let Some(slot) = self.slot.upgrade() else {
            return Ok(false);
        };
        let symbol = self.module.lookup(&self.name)?;
        slot.rebind(&symbol)?;
        Ok(true)
    }
}

struct Inner {
    config: RegistryConfig,
    loader: Arc<dyn ModuleLoader>,
    state: RwLock<State>,
    cycle: Mutex<()>,
    shutdown: CancellationToken,
    events: broadcast::Sender<RegistryEvent>,
    watcher: Mutex<Option<ConfigWatcher>>,
}

impl Inner {
    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn open_module(&self, descriptor: &PluginDescriptor) -> Result<ModuleHandle, LoadError> {
        let path = self.config.resolve_module_path(&descriptor.file);
        if let Some(expected) = &descriptor.sha256 {
            verify_checksum(&path, expected)?;
        }
        debug!("Opening module {:?} for plugin {}", path, descriptor.id);
        self.loader.open(&path)
    }

    fn read_descriptors(&self) -> RegistryResult<Vec<PluginDescriptor>> {
        let path = &self.config.descriptor_path;
        load_descriptors(path).map_err(|source| RegistryError::ConfigRead {
            path: path.clone(),
            source,
        })
    }

    fn load_config(self: &Arc<Self>) -> RegistryResult<LoadReport> {
        let _cycle = self.cycle.lock();
        self.state.read().ensure_open()?;

        info!("Loading plugin descriptors from {:?}", self.config.descriptor_path);
        let descriptors = self.read_descriptors()?;

        let mut report = LoadReport::default();
        let mut opened = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match self.open_module(&descriptor) {
                Ok(module) => opened.push((descriptor, module)),
                Err(source) if self.config.load_policy == LoadPolicy::AllOrNothing => {
                    error!("Failed to load plugin {}: {}", descriptor.id, source);
                    return Err(RegistryError::Load {
                        id: descriptor.id,
                        source,
                    });
                }
                Err(source) => {
                    warn!("Failed to load plugin {}: {}", descriptor.id, source);
                    self.emit(RegistryEvent::EntryFailed {
                        id: descriptor.id.clone(),
                        error: source.to_string(),
                    });
                    report.failed.push(EntryFailure::load(&descriptor.id, source));
                }
            }
        }

        let mut watcher_slot = self.watcher.lock();
        let watcher = if self.config.watch.enabled
            && !watcher_slot.as_ref().is_some_and(|w| w.is_running())
        {
            Some(self.start_watcher()?)
        } else {
            None
        };

        let mut rebinds = Vec::new();
        {
            let mut state = self.state.write();
            state.ensure_open()?;

            let mut previous = std::mem::take(&mut state.entries);
            state.descriptors = opened.iter().map(|(d, _)| d.clone()).collect();
            for (descriptor, module) in opened {
                // Watch registrations survive a reload of the same id
                let slot = previous.remove(&descriptor.id).and_then(|old| {
                    let slot = old.slot?;
                    if old.descriptor.file != descriptor.file {
                        rebinds.push(Rebind {
                            id: descriptor.id.clone(),
                            name: descriptor.name.clone(),
                            module: module.clone(),
                            slot: slot.clone(),
                        });
                    }
                    Some(slot)
                });
                report.loaded.push(descriptor.id.clone());
                state.entries.insert(
                    descriptor.id.clone(),
                    Entry {
                        descriptor,
                        module,
                        slot,
                    },
                );
            }
            state.lifecycle = Lifecycle::Active;
        }

        if let Some(watcher) = watcher {
            *watcher_slot = Some(watcher);
        }
        drop(watcher_slot);

        for target in rebinds {
            match target.apply() {
                Ok(true) => self.emit(RegistryEvent::Rebound {
                    id: target.id.clone(),
                }),
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to rebind plugin {}: {}", target.id, e);
                    self.emit(RegistryEvent::EntryFailed {
                        id: target.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Registry loaded {} plugins ({} failed)",
            report.loaded.len(),
            report.failed.len()
        );
        self.emit(RegistryEvent::Loaded {
            loaded: report.loaded.clone(),
            failed: report.failed.iter().map(|f| f.id.clone()).collect(),
        });

        Ok(report)
    }

    fn start_watcher(self: &Arc<Self>) -> RegistryResult<ConfigWatcher> {
        let weak = Arc::downgrade(self);
        ConfigWatcher::start(
            &self.config.descriptor_path,
            &self.config.watch,
            self.shutdown.clone(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.run_cycle();
                }
            },
        )
    }

    fn run_cycle(&self) {
        match self.check_changes() {
            Ok(report) => {
                if let Err(e) = report.into_result() {
                    warn!("Change cycle finished with failures: {}", e);
                }
            }
            Err(e) => debug!("Change cycle aborted: {}", e),
        }
    }

    fn check_changes(&self) -> RegistryResult<ChangeReport> {
        let _cycle = self.cycle.lock();

        let current = {
            let state = self.state.read();
            state.ensure_open()?;
            if state.lifecycle == Lifecycle::Uninitialized {
                debug!("Registry not loaded yet, skipping change cycle");
                return Ok(ChangeReport::default());
            }
            state.descriptors.clone()
        };

        let latest = match self.read_descriptors() {
            Ok(latest) => latest,
            Err(e) => {
                error!("{}", e);
                self.emit(RegistryEvent::ConfigRejected {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let changes = diff(&current, &latest);
        let mut report = ChangeReport::default();
        if changes.is_empty() {
            debug!("Descriptor file has no module changes");
            self.commit_baseline(latest)?;
            self.emit(report.summary());
            return Ok(report);
        }

        let mut added = Vec::with_capacity(changes.added.len());
        let mut changed = Vec::with_capacity(changes.changed.len());
        for (descriptors, opened) in [(&changes.added, &mut added), (&changes.changed, &mut changed)]
        {
            for descriptor in descriptors {
                match self.open_module(descriptor) {
                    Ok(module) => opened.push((descriptor.clone(), module)),
                    Err(e) => {
                        warn!("Failed to load plugin {}: {}", descriptor.id, e);
                        self.emit(RegistryEvent::EntryFailed {
                            id: descriptor.id.clone(),
                            error: e.to_string(),
                        });
                        report.failures.push(EntryFailure::load(&descriptor.id, e));
                    }
                }
            }
        }

        let failed: HashSet<String> = report.failures.iter().map(|f| f.id.clone()).collect();
        let mut rebinds = Vec::new();
        {
            let mut state = self.state.write();
            state.ensure_open()?;

            for descriptor in &changes.removed {
                state.entries.remove(&descriptor.id);
                report.removed.push(descriptor.id.clone());
            }

            for (descriptor, module) in added {
                report.added.push(descriptor.id.clone());
                state.entries.insert(
                    descriptor.id.clone(),
                    Entry {
                        descriptor,
                        module,
                        slot: None,
                    },
                );
            }

            for (descriptor, module) in changed {
                let slot = state.entries.remove(&descriptor.id).and_then(|old| old.slot);
                if let Some(slot) = &slot {
                    rebinds.push(Rebind {
                        id: descriptor.id.clone(),
                        name: descriptor.name.clone(),
                        module: module.clone(),
                        slot: slot.clone(),
                    });
                }
                report.changed.push(descriptor.id.clone());
                state.entries.insert(
                    descriptor.id.clone(),
                    Entry {
                        descriptor,
                        module,
                        slot,
                    },
                );
            }

            // Failed adds stay out and failed changes keep their old descriptor,
            // so the next cycle retries both.
            state.descriptors = latest
                .into_iter()
                .filter_map(|d| {
                    if failed.contains(&d.id) {
                        current.iter().find(|c| c.id == d.id).cloned()
                    } else {
                        Some(d)
                    }
                })
                .collect();
        }

        for id in &report.removed {
            info!("Plugin {} removed", id);
            self.emit(RegistryEvent::Removed { id: id.clone() });
        }
        for descriptor in changes.added.iter().filter(|d| !failed.contains(&d.id)) {
            info!("Plugin {} added from {:?}", descriptor.id, descriptor.file);
            self.emit(RegistryEvent::Added {
                id: descriptor.id.clone(),
                file: descriptor.file.clone(),
            });
        }
        for descriptor in changes.changed.iter().filter(|d| !failed.contains(&d.id)) {
            info!("Plugin {} changed to {:?}", descriptor.id, descriptor.file);
            self.emit(RegistryEvent::Changed {
                id: descriptor.id.clone(),
                file: descriptor.file.clone(),
            });
        }

        for target in rebinds {
            match target.apply() {
                Ok(true) => {
                    info!("Plugin {} rebound", target.id);
                    self.emit(RegistryEvent::Rebound {
                        id: target.id.clone(),
                    });
                    report.rebound.push(target.id);
                }
                Ok(false) => debug!("Watched slot for {} was dropped", target.id),
                Err(e) => {
                    error!("Failed to rebind plugin {}: {}", target.id, e);
                    self.emit(RegistryEvent::EntryFailed {
                        id: target.id.clone(),
                        error: e.to_string(),
                    });
                    report.failures.push(EntryFailure::symbol(&target.id, e));
                }
            }
        }

        info!(
            "Change cycle completed: {} added, {} changed, {} removed, {} failed",
            report.added.len(),
            report.changed.len(),
            report.removed.len(),
            report.failures.len()
        );
        self.emit(report.summary());

        Ok(report)
    }

    fn commit_baseline(&self, latest: Vec<PluginDescriptor>) -> RegistryResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.descriptors = latest;
        Ok(())
    }

    fn close(&self) {
        {
            let mut state = self.state.write();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Closed;
            state.entries.clear();
            state.descriptors.clear();
        }

        self.shutdown.cancel();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            debug!("Stopping watcher for {:?}", watcher.path());
        }

        info!("Registry closed");
        self.emit(RegistryEvent::Closed);
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Live-reloadable plugin registry
///
/// Each instance is independent; create as many as needed. The descriptor
/// watcher needs a tokio runtime, so call [`Registry::load_config`] from
/// within one (or disable watching in the [`RegistryConfig`]).
///
/// ```rust,ignore
/// let registry = Registry::new("plugins.json");
/// registry.load_config()?;
///
/// let add: Arc<Slot<fn(i32, i32) -> i32>> = Slot::shared();
/// registry.reload_and_watch("A", &add)?;
/// assert_eq!((*add.load().unwrap())(1, 2), 3);
/// ```
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create a registry for the descriptor file at `path`, opening modules
    /// with [`NativeLoader`]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_config(RegistryConfig::new(path))
    }

    /// Create a registry with `config`, opening modules with [`NativeLoader`]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self::with_loader(config, Arc::new(NativeLoader::new()))
    }

    /// Create a registry with a custom module loader
    pub fn with_loader(config: RegistryConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                loader,
                state: RwLock::new(State {
                    lifecycle: Lifecycle::Uninitialized,
                    descriptors: Vec::new(),
                    entries: HashMap::new(),
                }),
                cycle: Mutex::new(()),
                shutdown: CancellationToken::new(),
                events,
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Parse the descriptor file, open every module and start the watcher.
    ///
    /// Calling it again re-reads the file and rebuilds the index; watch
    /// registrations for ids that are still configured are kept.
    pub fn load_config(&self) -> RegistryResult<LoadReport> {
        self.inner.load_config()
    }

    /// Bind the current symbol of `id` into `slot` once.
    ///
    /// Serialized with change cycles, so a slot is never left on a module
    /// that a concurrent cycle just replaced.
    pub fn reload<T: Bindable>(&self, id: &str, slot: &Slot<T>) -> RegistryResult<()> {
        let _cycle = self.inner.cycle.lock();
        self.reload_locked(id, slot)
    }

    /// `reload` body; the caller holds the cycle lock
    fn reload_locked<T: Bindable>(&self, id: &str, slot: &Slot<T>) -> RegistryResult<()> {
        let symbol = self.get_symbol_by_id(id)?;
        bind(&symbol, slot).map_err(|source| RegistryError::Symbol {
            id: id.to_string(),
            source,
        })
    }

    /// Rebind `slot` whenever the module of `id` changes.
    ///
    /// Replaces any slot previously watched for `id`.
    pub fn watch<T: Bindable>(&self, id: &str, slot: &Arc<Slot<T>>) -> RegistryResult<()> {
        let mut state = self.inner.state.write();
        state.ensure_open()?;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotConfigured(id.to_string()))?;

        if entry.watched().is_some() {
            debug!("Replacing watched slot for {}", id);
        }
        entry.slot = Some(slot_ref(slot));
        Ok(())
    }

    /// [`reload`](Self::reload) then [`watch`](Self::watch); nothing is
    /// registered if the bind fails
    pub fn reload_and_watch<T: Bindable>(
        &self,
        id: &str,
        slot: &Arc<Slot<T>>,
    ) -> RegistryResult<()> {
        let _cycle = self.inner.cycle.lock();
        self.reload_locked(id, slot)?;
        self.watch(id, slot)
    }

    /// Symbol the watched slot for `id` was last bound from
    pub fn get_by_id(&self, id: &str) -> RegistryResult<Option<Symbol>> {
        let state = self.inner.state.read();
        let entry = state.entry(id)?;
        Ok(entry.watched().and_then(|slot| slot.bound_symbol()))
    }

    /// Resolve the symbol for `id` from its current module
    pub fn get_symbol_by_id(&self, id: &str) -> RegistryResult<Symbol> {
        let (module, name) = {
            let state = self.inner.state.read();
            let entry = state.entry(id)?;
            (entry.module.clone(), entry.descriptor.name.clone())
        };

        module
            .lookup(&name)
            .map_err(|source| RegistryError::Symbol {
                id: id.to_string(),
                source,
            })
    }

    /// Ids of the entries whose symbol declares every capability in `capabilities`
    pub fn find_by_capability(&self, capabilities: &CapabilitySet) -> RegistryResult<Vec<String>> {
        capabilities.validate()?;

        let candidates: Vec<(String, String, ModuleHandle, Option<Symbol>)> = {
            let state = self.inner.state.read();
            state.ensure_open()?;
            state
                .descriptors
                .iter()
                .filter_map(|d| state.entries.get(&d.id))
                .map(|entry| {
                    (
                        entry.descriptor.id.clone(),
                        entry.descriptor.name.clone(),
                        entry.module.clone(),
                        entry.watched().and_then(|slot| slot.bound_symbol()),
                    )
                })
                .collect()
        };

        let mut matches = Vec::new();
        for (id, name, module, bound) in candidates {
            let symbol = match bound {
                Some(symbol) => symbol,
                None => match module.lookup(&name) {
                    Ok(symbol) => symbol,
                    Err(e) => {
                        debug!("Skipping plugin {}: {}", id, e);
                        continue;
                    }
                },
            };
            if symbol.satisfies(capabilities) {
                matches.push(id);
            }
        }

        Ok(matches)
    }

    /// Run one change-detection cycle against the descriptor file
    pub fn check_changes(&self) -> RegistryResult<ChangeReport> {
        self.inner.check_changes()
    }

    /// Descriptors currently in effect
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.inner.state.read().descriptors.clone()
    }

    /// Indexed ids, in descriptor order
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .state
            .read()
            .descriptors
            .iter()
            .map(|d| d.id.clone())
            .collect()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.state.read().lifecycle == Lifecycle::Closed
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the watcher and drop every entry. Idempotent.
    ///
    /// Does not wait for an in-flight change cycle; that cycle finds the
    /// registry closed and commits nothing.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Registry")
            .field("descriptor_path", &self.inner.config.descriptor_path)
            .field("lifecycle", &state.lifecycle)
            .field("entries", &state.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{MemoryLoader, MemoryModule};

    type AddFn = fn(i32, i32) -> i32;

    fn add(x: i32, y: i32) -> i32 {
        x + y
    }

    fn registry(json: &str, loader: MemoryLoader) -> (tempfile::TempDir, Registry) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("plugins.json");
        std::fs::write(&path, json).unwrap();
        let registry = Registry::with_loader(
            RegistryConfig::new(&path).without_watch(),
            Arc::new(loader),
        );
        (temp_dir, registry)
    }

    #[test]
    fn test_close_before_load() {
        let registry = Registry::new("/nonexistent/plugins.json");
        assert!(!registry.is_closed());

        registry.close();
        registry.close();
        assert!(registry.is_closed());
        assert!(matches!(registry.load_config(), Err(RegistryError::Closed)));
        assert!(matches!(
            registry.get_symbol_by_id("A"),
            Err(RegistryError::Closed)
        ));
    }

    #[test]
    fn test_uninitialized_lookups() {
        let (_dir, registry) = registry("[]", MemoryLoader::new());
        assert!(matches!(
            registry.get_by_id("A"),
            Err(RegistryError::NotConfigured(_))
        ));
        assert!(registry.check_changes().unwrap().is_noop());
    }

    #[test]
    fn test_load_then_reload() {
        let loader = MemoryLoader::new()
            .with_module(MemoryModule::new("m1.so").with_function("Add", add as AddFn));
        let (_dir, registry) = registry(
            r#"[{"file": "m1.so", "id": "A", "name": "Add"}]"#,
            loader,
        );

        let report = registry.load_config().unwrap();
        assert_eq!(report.loaded, vec!["A".to_string()]);
        assert_eq!(registry.ids(), vec!["A".to_string()]);

        let slot: Slot<AddFn> = Slot::new();
        registry.reload("A", &slot).unwrap();
        assert_eq!((*slot.load().unwrap())(1, 2), 3);

        // Not watched, so nothing to report
        assert!(registry.get_by_id("A").unwrap().is_none());
    }

    #[test]
    fn test_debug_output() {
        let registry = Registry::new("plugins.json");
        let debug = format!("{:?}", registry);
        assert!(debug.contains("Uninitialized"));
        assert!(debug.contains("plugins.json"));
    }
}
