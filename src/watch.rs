//! Script file watching for hot reload.
//!
//! The watcher only records that the script changed. The host polls
//! [`ScriptWatcher::take_change`] from its control thread between blocks and
//! calls `reload()` itself, so no reload is ever driven from the watcher's
//! own thread.

use crate::error::BridgeResult;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use tracing::{debug, warn};

/// Watches one script file.
pub struct ScriptWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    path: PathBuf,
}

impl std::fmt::Debug for ScriptWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptWatcher")
            .field("path", &self.path)
            .finish()
    }
}

impl ScriptWatcher {
    /// Start watching `path`.
    ///
    /// The parent directory is watched so that editors which replace the
    /// file on save are still noticed.
    pub fn new(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        debug!("Watching {:?} for changes", path);

        Ok(Self {
            _watcher: watcher,
            events,
            path,
        })
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file changed since the last call. Never blocks.
    pub fn take_change(&self) -> bool {
        let mut changed = false;
        for result in self.events.try_iter() {
            match result {
                Ok(event) if self.concerns_script(&event) => changed = true,
                Ok(_) => {}
                Err(err) => warn!("File watch error: {}", err),
            }
        }
        changed
    }

    fn concerns_script(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }
}
