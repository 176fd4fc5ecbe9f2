//! Config hot reload.
//!
//! The watcher listens for file-system notifications on the config file's
//! directory (editors often replace the file instead of writing it in
//! place), debounced so one save triggers one reload.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AutofireConfig;
use crate::engine::AutofireEngine;
use crate::error::{AutofireError, Result};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Re-applies a config file to an engine when its contents change. An
/// engine that was armed is re-armed after the apply.
pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
    last: Option<String>,
}

impl ConfigWatcher {
    /// `loaded` is the text the engine is currently running from, if any;
    /// identical contents are not re-applied.
    pub fn new(path: impl Into<PathBuf>, loaded: Option<String>) -> Self {
        Self {
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
            last: loaded,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory to watch: the file's parent, or the working directory for
    /// a bare file name.
    fn watch_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn concerns(&self, event: &DebouncedEvent) -> bool {
        event.path.file_name().is_some() && event.path.file_name() == self.path.file_name()
    }

    /// Look at the file once. Returns whether a new config was applied.
    ///
    /// A missing file is not an error. Contents that fail to parse or
    /// validate are remembered, so the same broken edit is reported once,
    /// and the running slots stay in place.
    pub async fn check(&mut self, engine: &AutofireEngine) -> Result<bool> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "config file missing, nothing to reload");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if self.last.as_deref() == Some(contents.as_str()) {
            return Ok(false);
        }
        self.last = Some(contents.clone());

        let config = AutofireConfig::from_json_str(&contents)
            .and_then(|config| config.validate().map(|()| config))
            .map_err(|e| {
                AutofireError::config_load(self.path.display().to_string(), e.to_string())
            });
        let config = match config {
            Ok(config) => config,
            Err(e) => {
                engine.report_rejected(&e);
                return Err(e);
            }
        };

        let was_armed = engine.status().await.armed;
        engine.apply(config.slots).await?;
        if was_armed {
            engine.start().await?;
        }
        info!(path = %self.path.display(), rearmed = was_armed, "config reloaded");
        Ok(true)
    }

    /// Start watching. Fails if the directory cannot be watched; otherwise
    /// the task runs until aborted.
    pub fn spawn(mut self, engine: Arc<AutofireEngine>) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })?;
        let dir = self.watch_dir();
        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %self.path.display(), "watching config for changes");

        Ok(tokio::spawn(async move {
            // Dropping the debouncer stops its thread.
            let _debouncer = debouncer;
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(events) => {
                        if !events.iter().any(|e| self.concerns(e)) {
                            continue;
                        }
                        if let Err(e) = self.check(&engine).await {
                            warn!(error = %e, "config reload failed, keeping current slots");
                        }
                    }
                    Err(e) => warn!(error = %e, "config watch error"),
                }
            }
        }))
    }
}
