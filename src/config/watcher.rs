//! Configuration file watcher for hot reload.
//!
//! One editor save usually fires several events (truncate, write, rename).
//! The watcher listens on the parent directory, keeps only events that name
//! the config file, and reloads once the burst has settled.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time;

use crate::config::loader::load_config;
use crate::config::schema::MonitorConfig;

/// Quiet period that ends a burst of file events.
const SETTLE: Duration = Duration::from_millis(250);

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<MonitorConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver of validated configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<MonitorConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. Must be called from within a tokio runtime;
    /// dropping the returned watcher stops the reload task.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let file_name: OsString = self
            .path
            .file_name()
            .ok_or_else(|| notify::Error::generic("config path has no file name"))?
            .to_os_string();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if is_config_change(&event, &file_name) && event_tx.send(()).is_err() {
                        tracing::debug!("Config reload task stopped, ignoring file event");
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(watch_dir(&self.path), RecursiveMode::NonRecursive)?;
        tokio::spawn(reload_loop(self.path.clone(), event_rx, self.update_tx));

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// A modify or create event naming the config file.
fn is_config_change(event: &Event, file_name: &OsStr) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event.paths.iter().any(|p| p.file_name() == Some(file_name))
}

async fn reload_loop(
    path: PathBuf,
    mut events: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<MonitorConfig>,
) {
    let mut last: Option<MonitorConfig> = None;

    while settle(&mut events, SETTLE).await {
        tracing::info!(path = ?path, "Config file change detected, reloading");
        match load_config(&path) {
            Ok(config) if last.as_ref() == Some(&config) => {
                tracing::debug!(path = ?path, "Config content unchanged, skipping reload");
            }
            Ok(config) => {
                last = Some(config.clone());
                if updates.send(config).is_err() {
                    tracing::warn!(path = ?path, "Config update receiver dropped, stopping watcher");
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
            }
        }
    }
    tracing::debug!(path = ?path, "Config watcher stopped");
}

/// Wait for one event, then until none arrives for `quiet`. Returns false
/// once the event source is gone with nothing pending.
async fn settle(events: &mut mpsc::UnboundedReceiver<()>, quiet: Duration) -> bool {
    if events.recv().await.is_none() {
        return false;
    }
    while let Ok(Some(())) = time::timeout(quiet, events.recv()).await {}
    true
}
