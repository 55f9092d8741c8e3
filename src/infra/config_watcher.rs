//! Hot reload of the configuration file
//!
//! Polled once per tick. A reload happens only when the file's modification
//! time has advanced past the last successful load, and the active snapshot
//! is swapped only when the whole file parses and validates.

use crate::infra::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Marker has not advanced
    Unchanged,
    /// New snapshot is active
    Reloaded,
    /// File changed but was rejected; previous snapshot kept
    Rejected,
    /// Marker could not be read (file missing or unreadable)
    Unavailable,
}

pub struct ConfigWatcher {
    path: PathBuf,
    current: Arc<Config>,
    /// Modification time of the file behind `current`
    loaded_marker: Option<SystemTime>,
    /// Last marker that failed to load, to avoid repeating the error log
    failed_marker: Option<SystemTime>,
    marker_missing_logged: bool,
}

impl ConfigWatcher {
    /// Load the file at `path`, falling back to defaults if it is missing or invalid
    ///
    /// A file that fails here is retried by the next `poll`, which reports the
    /// error again; `open` may run before any subscriber is installed.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut watcher = Self {
            path,
            current: Arc::new(Config::default()),
            loaded_marker: None,
            failed_marker: None,
            marker_missing_logged: false,
        };
        if watcher.poll() != ReloadOutcome::Reloaded {
            watcher.failed_marker = None;
            watcher.marker_missing_logged = false;
        }
        watcher
    }

    /// No file has been loaded successfully yet
    pub fn using_defaults(&self) -> bool {
        self.loaded_marker.is_none()
    }

    /// Immutable snapshot for one tick
    pub fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.current)
    }

    /// Cooperative stop flag of the active snapshot
    pub fn stop_requested(&self) -> bool {
        self.current.stop_running()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload if the modification marker advanced since the last good load
    pub fn poll(&mut self) -> ReloadOutcome {
        let marker = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(marker) => {
                self.marker_missing_logged = false;
                marker
            }
            Err(e) => {
                if !self.marker_missing_logged {
                    warn!(config_file = %self.path.display(), error = %e, "config_marker_unavailable");
                    self.marker_missing_logged = true;
                }
                return ReloadOutcome::Unavailable;
            }
        };

        if let Some(loaded) = self.loaded_marker {
            if marker <= loaded {
                return ReloadOutcome::Unchanged;
            }
        }

        match Config::from_file(&self.path) {
            Ok(config) => {
                let previous = Arc::clone(&self.current);
                log_restart_only_changes(&previous, &config);
                info!(
                    config_file = %self.path.display(),
                    setup_mode = %config.setup_mode(),
                    video_preview = %config.runtime().video_preview,
                    stop_running = %config.stop_running(),
                    "config_reloaded"
                );
                self.current = Arc::new(config);
                self.loaded_marker = Some(marker);
                self.failed_marker = None;
                ReloadOutcome::Reloaded
            }
            Err(e) => {
                if self.failed_marker == Some(marker) {
                    debug!(config_file = %self.path.display(), error = %e, "config_reload_still_invalid");
                } else {
                    error!(config_file = %self.path.display(), error = %e, "config_reload_rejected");
                    self.failed_marker = Some(marker);
                }
                ReloadOutcome::Rejected
            }
        }
    }
}

/// Camera and logging settings are bound at startup
fn log_restart_only_changes(previous: &Config, next: &Config) {
    if previous.config_file() == "default" {
        return;
    }
    if previous.camera() != next.camera() {
        warn!("config_camera_changed_requires_restart");
    }
    if previous.logging() != next.logging() {
        warn!("config_logging_changed_requires_restart");
    }
}
