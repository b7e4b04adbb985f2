//! Change Notifier - debounce, diff and fan-out
//!
//! Raw watcher events are buffered per path for a short window. When the
//! window expires the path is observed again and compared with its last
//! recorded [`FileSystemState`]: identical means no event, different means
//! exactly one `Added`/`Modified`/`Removed` pushed to every matching
//! subscription.

use remofs_core::hasher::snapshot_tree;
use remofs_core::path::{ancestors, is_within, relative_to};
use remofs_core::{ChangeKind, ChangeNotification, EntryKind, FileSystemState, Frame};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tokio::sync::RwLock;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::watcher::RawEvent;

pub type SessionId = Uuid;

/// Frames queued for one session's writer
pub type Outbox = Sender<Frame>;

/// Frames a session may have queued before responses wait and
/// notifications are dropped
pub const OUTBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSubscription {
    pub session_id: SessionId,
    pub path: String,
    pub recursive: bool,
}

struct Subscriber {
    recursive: bool,
    outbox: Outbox,
}

/// Subscriptions keyed by watched path, then by session.
///
/// Fan-out walks the changed path's ancestors, so lookups cost one map hit
/// per path segment. Reads are concurrent; register/unregister serialize.
#[derive(Clone, Default)]
pub struct SubscriptionIndex {
    by_path: Arc<RwLock<HashMap<String, HashMap<SessionId, Subscriber>>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; watching the same path again updates `recursive`
    pub async fn watch(&self, session_id: SessionId, path: String, recursive: bool, outbox: Outbox) {
        let mut by_path = self.by_path.write().await;
        by_path
            .entry(path)
            .or_default()
            .insert(session_id, Subscriber { recursive, outbox });
    }

    /// Idempotent
    pub async fn unwatch(&self, session_id: SessionId, path: &str) {
        let mut by_path = self.by_path.write().await;
        if let Some(sessions) = by_path.get_mut(path) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                by_path.remove(path);
            }
        }
    }

    /// Drop every subscription a disconnected session held
    pub async fn remove_session(&self, session_id: SessionId) {
        let mut by_path = self.by_path.write().await;
        by_path.retain(|_, sessions| {
            sessions.remove(&session_id);
            !sessions.is_empty()
        });
    }

    pub async fn subscriptions(&self) -> Vec<WatchSubscription> {
        let by_path = self.by_path.read().await;
        let mut subs: Vec<_> = by_path
            .iter()
            .flat_map(|(path, sessions)| {
                sessions.iter().map(move |(id, sub)| WatchSubscription {
                    session_id: *id,
                    path: path.clone(),
                    recursive: sub.recursive,
                })
            })
            .collect();
        subs.sort_by(|a, b| a.path.cmp(&b.path).then(a.session_id.cmp(&b.session_id)));
        subs
    }

    /// Push `change` to every session watching the path or a recursive
    /// ancestor of it. Each session receives it at most once; a session
    /// whose outbox is full misses it.
    pub async fn publish(&self, change: &ChangeNotification) -> usize {
        let frame = match Frame::notification(change) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping notification for {}: {}", change.path, e);
                return 0;
            }
        };

        let by_path = self.by_path.read().await;
        let mut targets: HashMap<SessionId, &Outbox> = HashMap::new();
        for candidate in ancestors(&change.path) {
            let Some(sessions) = by_path.get(candidate) else {
                continue;
            };
            let exact = candidate == change.path;
            for (id, sub) in sessions {
                if exact || sub.recursive {
                    targets.entry(*id).or_insert(&sub.outbox);
                }
            }
        }

        let mut delivered = 0;
        for (id, outbox) in targets {
            match outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Session {} is not keeping up, dropped {:?} {}", id, change.kind, change.path)
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

/// Last observed state of every path under the root.
///
/// Every method touches the disk, so callers on the runtime go through
/// `spawn_blocking`.
struct RecordedTree {
    root: PathBuf,
    states: HashMap<String, FileSystemState>,
}

impl RecordedTree {
    fn seed(&mut self) -> usize {
        let states = snapshot_tree(&self.root, "");
        self.states = states.into_iter().map(|s| (s.path.clone(), s)).collect();
        info!("Recorded {} entries under {:?}", self.states.len(), self.root);
        self.states.len()
    }

    fn diff(&mut self, rel: &str) -> Vec<ChangeNotification> {
        let current = FileSystemState::observe_with_fingerprint(&self.root, rel);
        let previous = self.states.get(rel);
        let was_dir = previous.is_some_and(|p| p.kind == EntryKind::Directory);

        let kind = match previous {
            Some(prev) if prev.is_same_as(&current) => None,
            Some(_) if !current.exists() => Some(ChangeKind::Removed),
            Some(_) => Some(ChangeKind::Modified),
            None if current.exists() => Some(ChangeKind::Added),
            None => None,
        };

        let mut changes = Vec::new();
        if was_dir && current.kind != EntryKind::Directory {
            self.remove_descendants(rel, &mut changes);
        }
        if let Some(kind) = kind {
            changes.push(ChangeNotification {
                path: rel.to_string(),
                kind,
            });
        }

        let is_dir = current.kind == EntryKind::Directory;
        if current.exists() {
            self.states.insert(rel.to_string(), current);
        } else {
            self.states.remove(rel);
        }
        if is_dir && !was_dir {
            self.add_descendants(rel, &mut changes);
        }
        changes
    }

    fn remove_descendants(&mut self, rel: &str, changes: &mut Vec<ChangeNotification>) {
        let mut gone: Vec<String> = self
            .states
            .keys()
            .filter(|path| path.as_str() != rel && is_within(rel, path))
            .cloned()
            .collect();
        gone.sort_by(|a, b| b.cmp(a));

        for path in gone {
            self.states.remove(&path);
            changes.push(ChangeNotification {
                path,
                kind: ChangeKind::Removed,
            });
        }
    }

    fn add_descendants(&mut self, rel: &str, changes: &mut Vec<ChangeNotification>) {
        let mut found = snapshot_tree(&self.root, rel);
        found.sort_by(|a, b| a.path.cmp(&b.path));

        for state in found {
            let kind = match self.states.get(&state.path) {
                Some(prev) if prev.is_same_as(&state) => continue,
                Some(_) => ChangeKind::Modified,
                None => ChangeKind::Added,
            };
            changes.push(ChangeNotification {
                path: state.path.clone(),
                kind,
            });
            self.states.insert(state.path.clone(), state);
        }
    }
}

/// Owns the recorded states and the per-path debounce deadlines
pub struct ChangeNotifier {
    root: PathBuf,
    window: Duration,
    tree: Arc<Mutex<RecordedTree>>,
    pending: HashMap<String, Instant>,
    index: SubscriptionIndex,
}

fn lock(tree: &Mutex<RecordedTree>) -> MutexGuard<'_, RecordedTree> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChangeNotifier {
    pub fn new(root: impl Into<PathBuf>, window: Duration, index: SubscriptionIndex) -> Self {
        let root = root.into();
        Self {
            tree: Arc::new(Mutex::new(RecordedTree {
                root: root.clone(),
                states: HashMap::new(),
            })),
            root,
            window,
            pending: HashMap::new(),
            index,
        }
    }

    /// Record the current state of the whole tree. Blocking.
    pub fn seed(&mut self) -> usize {
        lock(&self.tree).seed()
    }

    pub fn recorded(&self, rel: &str) -> Option<FileSystemState> {
        lock(&self.tree).states.get(rel).cloned()
    }

    /// Consume raw events until cancelled or the event source closes
    pub async fn run(mut self, mut events: UnboundedReceiver<RawEvent>, cancel: CancellationToken) {
        loop {
            let deadline = self.pending.values().min().copied();
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.enqueue(event, Instant::now()),
                    None => {
                        self.flush(None).await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(Some(Instant::now())).await;
                }
            }
        }
        debug!("Change notifier stopped");
    }

    /// Start a window for the path unless one is already open
    pub fn enqueue(&mut self, event: RawEvent, now: Instant) {
        let Some(rel) = relative_to(&self.root, &event.path) else {
            return;
        };
        if rel.is_empty() {
            return;
        }
        self.pending.entry(rel).or_insert(now + self.window);
    }

    /// Process every path whose window closed by `now` (all of them for `None`)
    async fn flush(&mut self, now: Option<Instant>) {
        let mut due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, deadline)| now.map_or(true, |now| **deadline <= now))
            .map(|(path, _)| path.clone())
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort();
        for rel in &due {
            self.pending.remove(rel);
        }

        // Hashing and subtree walks stay off the runtime threads
        let tree = Arc::clone(&self.tree);
        let diffed = tokio::task::spawn_blocking(move || {
            let mut tree = lock(&tree);
            due.iter().flat_map(|rel| tree.diff(rel)).collect::<Vec<_>>()
        })
        .await;
        let changes = match diffed {
            Ok(changes) => changes,
            Err(e) => {
                error!("Change diff failed: {}", e);
                return;
            }
        };

        for change in changes {
            let delivered = self.index.publish(&change).await;
            debug!("{:?} {} -> {} subscriber(s)", change.kind, change.path, delivered);
        }
    }

    /// Compare a fresh observation of `rel` with the recorded state and
    /// update the record. Returns the semantic changes, parents first for
    /// additions and children first for removals. Blocking.
    pub fn diff(&mut self, rel: &str) -> Vec<ChangeNotification> {
        lock(&self.tree).diff(rel)
    }
}
