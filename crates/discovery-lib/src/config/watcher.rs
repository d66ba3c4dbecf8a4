//! Reloads the wired discovery configuration when its file changes
//!
//! Mounted ConfigMaps are updated by swapping a symlink in the parent
//! directory, so the directory is watched and events are filtered down to
//! the configuration file.

use super::{ConfigHandler, DiscoveryConfig};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Watches the wired configuration file and pushes reloads into a [`ConfigHandler`]
pub struct ConfigFileWatcher {
    path: PathBuf,
    handler: Arc<ConfigHandler>,
}

impl ConfigFileWatcher {
    pub fn new(path: impl Into<PathBuf>, handler: Arc<ConfigHandler>) -> Self {
        Self {
            path: path.into(),
            handler,
        }
    }

    /// Start watching. Watching stops when the returned handle is dropped.
    pub fn start(self) -> Result<ConfigWatcherHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create config file watcher")?;

        let dir = watch_dir(&self.path);
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        info!(path = %self.path.display(), "Watching discovery config file");

        let path = self.path;
        let handler = self.handler;
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !is_relevant(&event, &path) {
                    continue;
                }
                reload(&path, &handler);
            }
            debug!("Config watcher channel closed");
        });

        Ok(ConfigWatcherHandle {
            _watcher: watcher,
            _task: task,
        })
    }
}

/// Handle to a running config watcher
/// Stops watching when dropped
pub struct ConfigWatcherHandle {
    _watcher: RecommendedWatcher,
    _task: tokio::task::JoinHandle<()>,
}

impl Drop for ConfigWatcherHandle {
    fn drop(&mut self) {
        self._task.abort();
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn is_relevant(event: &Event, path: &Path) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    // symlink swaps surface as events on ..data rather than the file itself
    event.paths.iter().any(|p| {
        p == path
            || p.file_name() == path.file_name()
            || p.file_name().is_some_and(|name| name == "..data")
    })
}

/// Reload the file and hand it to the handler, keeping the previous config on failure
pub(crate) fn reload(path: &Path, handler: &ConfigHandler) -> bool {
    match DiscoveryConfig::from_file(path) {
        Ok(cfg) => {
            info!(path = %path.display(), rules = cfg.plugin_configs.len(), "Reloaded discovery config");
            handler.set_wired(cfg);
            true
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to reload discovery config");
            false
        }
    }
}
