//! Descriptor file watcher
//!
//! Watches the descriptor file's directory (editors often replace files by
//! rename, which a watch on the file itself would miss) and runs a change
//! cycle after each burst of qualifying events. Notify callbacks feed a
//! bounded work queue drained by a single task; the task stops at its next
//! wait point once the shutdown token is cancelled.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{AccessKind, AccessMode, ModifyKind},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::error::RegistryError;

/// Background watcher for one descriptor file
pub(crate) struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `descriptor_path`, calling `on_change` (on a blocking
    /// thread) once per burst of changes.
    pub(crate) fn start<F>(
        descriptor_path: &Path,
        config: &WatchConfig,
        shutdown: CancellationToken,
        on_change: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RegistryError::Watch(format!("no tokio runtime: {}", e)))?;

        let file_name = descriptor_path
            .file_name()
            .ok_or_else(|| {
                RegistryError::Watch(format!("not a file path: {:?}", descriptor_path))
            })?
            .to_os_string();
        let dir = match descriptor_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                // A full queue already guarantees a pending cycle.
                Ok(event) => {
                    let _ = tx.try_send(event);
                }
                Err(e) => warn!("Watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| RegistryError::Watch(e.to_string()))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| RegistryError::Watch(e.to_string()))?;

        info!("Watching descriptor file {:?}", descriptor_path);

        let task = runtime.spawn(run(
            rx,
            file_name,
            config.debounce,
            shutdown,
            Arc::new(on_change),
        ));

        Ok(Self {
            path: descriptor_path.to_path_buf(),
            _watcher: watcher,
            task,
        })
    }

    /// Watched descriptor file
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the event task is still running
    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

async fn run<F>(
    mut rx: mpsc::Receiver<Event>,
    file_name: OsString,
    debounce: Duration,
    shutdown: CancellationToken,
    on_change: Arc<F>,
) where
    F: Fn() + Send + Sync + 'static,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        debug!("Watch event: {:?}", event);
        if !is_descriptor_change(&event, &file_name) {
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(debounce) => {}
        }
        let mut coalesced = 0usize;
        while rx.try_recv().is_ok() {
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!("Debounced {} queued events", coalesced);
        }

        info!("Descriptor file {:?} is modified", file_name);
        let on_change = on_change.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || (*on_change)()).await {
            error!("Change cycle aborted: {}", e);
        }
    }

    info!("Config watcher shutting down");
}

/// Whether `event` is a write, create or rename touching the descriptor file
pub(crate) fn is_descriptor_change(event: &Event, file_name: &OsString) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    );

    relevant
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}
