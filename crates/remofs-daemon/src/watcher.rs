//! File Watcher - raw file system events
//!
//! Uses notify crate (FSEvents on macOS, inotify on Linux).
//! Emits a stream of raw `(path, kind)` events; duplicates and bursts are
//! expected and left to the change notifier to coalesce.

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Create,
    Modify,
    Remove,
    /// Rescans, renames the platform could not classify, etc.
    Other,
}

/// One unprocessed watcher event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: RawEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Recursive watcher over the whole served root
pub struct FsWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl FsWatcher {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            watcher: None,
        }
    }

    /// Start watching, forwarding raw events into `events`
    pub fn start(&mut self, events: UnboundedSender<RawEvent>) -> Result<()> {
        let handler = move |result: notify::Result<Event>| match result {
            Ok(event) => {
                let kind = match event.kind {
                    EventKind::Create(_) => RawEventKind::Create,
                    EventKind::Modify(_) => RawEventKind::Modify,
                    EventKind::Remove(_) => RawEventKind::Remove,
                    EventKind::Access(_) => return,
                    EventKind::Any | EventKind::Other => RawEventKind::Other,
                };
                for path in event.paths {
                    debug!("Raw change: {:?} ({:?})", path, kind);
                    let _ = events.send(RawEvent { path, kind });
                }
            }
            Err(e) => {
                warn!("Watch error: {:?}", e);
            }
        };

        let mut watcher = RecommendedWatcher::new(handler, Config::default())?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        self.watcher = Some(watcher);
        info!("File watcher started for: {:?}", self.root);
        Ok(())
    }

    /// Stop watching
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("File watcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
