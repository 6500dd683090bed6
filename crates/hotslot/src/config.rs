//! Registry configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

/// What `load_config` does when some modules fail to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Commit every entry that loaded; report the rest
    #[default]
    BestEffort,
    /// Abort on the first failure and commit nothing
    AllOrNothing,
}

/// Descriptor-file watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Start the watcher after a successful load
    pub enabled: bool,
    /// Quiet period after an event before a change cycle runs
    pub debounce: Duration,
    /// Capacity of the pending-event queue
    pub queue_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(100),
            queue_capacity: 64,
        }
    }
}

impl WatchConfig {
    /// Create a new watch config
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable watching
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set debounce duration
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set pending-event queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Descriptor file
    pub descriptor_path: PathBuf,
    /// Failure policy for the initial load
    pub load_policy: LoadPolicy,
    /// Base directory for relative module paths
    pub module_dir: Option<PathBuf>,
    /// Watch configuration
    pub watch: WatchConfig,
    /// Capacity of the registry event channel
    pub event_capacity: usize,
}

impl RegistryConfig {
    /// Create a configuration for the given descriptor file
    pub fn new<P: AsRef<Path>>(descriptor_path: P) -> Self {
        Self {
            descriptor_path: descriptor_path.as_ref().to_path_buf(),
            load_policy: LoadPolicy::default(),
            module_dir: None,
            watch: WatchConfig::default(),
            event_capacity: 256,
        }
    }

    /// Set load policy
    pub fn with_load_policy(mut self, policy: LoadPolicy) -> Self {
        self.load_policy = policy;
        self
    }

    /// Resolve relative module paths against `dir`
    pub fn with_module_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.module_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Set watch configuration
    pub fn with_watch_config(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    /// Disable the descriptor watcher
    pub fn without_watch(mut self) -> Self {
        self.watch.enabled = false;
        self
    }

    /// Set event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Where the module for `file` lives
    pub fn resolve_module_path(&self, file: &Path) -> PathBuf {
        match &self.module_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.to_path_buf(),
        }
    }
}
