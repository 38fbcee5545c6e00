//! Reference-counted directory watching.
//!
//! Read-only storage instances follow a concurrent writer by watching the
//! data and index directories. OS watch handles are a limited resource, so
//! a process-wide registry keeps exactly one backing [`notify`] watcher per
//! directory and multiplexes its events to any number of subscribers, each
//! filtered by file name. The registry entry is released when the last
//! subscriber closes.
//!
//! Events are delivered over per-subscriber channels and drained by
//! polling ([`Watcher::try_events`]); no user code runs on the notify
//! callback thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex, OnceLock};

use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use tracing::{debug, trace};

use crate::StorageError;

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// File contents or metadata changed.
    Change,
    /// File appeared, disappeared, or was renamed.
    Rename,
}

/// A change notification for a single file inside a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// File name relative to the watched directory.
    pub file_name: String,
}

/// One subscriber's registration with a directory watcher.
struct Subscriber {
    id: u64,
    /// Only events whose file name equals the filter are delivered.
    /// `None` receives every event in the directory.
    filter: Option<String>,
    tx: Sender<WatchEvent>,
}

/// Shared state behind one OS watch handle.
struct DirectoryWatcher {
    /// Keeps the OS watch alive; dropped when the refcount reaches zero.
    _backend: notify::RecommendedWatcher,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    refcount: usize,
    next_subscriber_id: u64,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, DirectoryWatcher>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, DirectoryWatcher>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Maps a notify event kind onto the two-valued model watchers expose.
///
/// Creations, removals, and renames all surface as `Rename` (presence
/// changed); data and metadata modifications surface as `Change`.
fn map_event_kind(kind: &EventKind) -> Option<WatchEventKind> {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) => Some(WatchEventKind::Rename),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => Some(WatchEventKind::Rename),
        EventKind::Modify(_) | EventKind::Any => Some(WatchEventKind::Change),
        EventKind::Access(_) | EventKind::Other => None,
    }
}

/// Fans one notify event out to the matching subscribers.
///
/// Subscribers whose channel has been dropped are removed here; a send
/// failure never propagates to the notify thread.
fn dispatch(subscribers: &Arc<Mutex<Vec<Subscriber>>>, event: &Event) {
    let Some(kind) = map_event_kind(&event.kind) else {
        return;
    };
    let mut subscribers = match subscribers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    for path in &event.paths {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        trace!(file = %file_name, ?kind, "dispatching watch event");
        subscribers.retain(|subscriber| {
            let interested = subscriber
                .filter
                .as_ref()
                .is_none_or(|filter| *filter == file_name);
            if !interested {
                return true;
            }
            subscriber
                .tx
                .send(WatchEvent {
                    kind,
                    file_name: file_name.clone(),
                })
                .is_ok()
        });
    }
}

/// A subscription to file-system events for one file or directory.
///
/// Created through [`Watcher::subscribe`]; events accumulate in an internal
/// channel until drained with [`Watcher::try_events`]. Dropping the watcher
/// closes the subscription.
pub struct Watcher {
    directory: PathBuf,
    subscriber_id: u64,
    rx: Receiver<WatchEvent>,
    closed: bool,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("directory", &self.directory)
            .field("subscriber_id", &self.subscriber_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Watcher {
    /// Subscribes to events for `target`.
    ///
    /// When `target` is a directory, all events inside it are delivered
    /// (optionally narrowed by `filter`). When `target` is a file, the
    /// parent directory is watched and the filter defaults to the file's
    /// own name.
    pub fn subscribe(target: &Path, filter: Option<String>) -> Result<Self, StorageError> {
        let (directory, filter) = if target.is_dir() {
            (target.to_path_buf(), filter)
        } else {
            let parent = target.parent().unwrap_or_else(|| Path::new("."));
            let default_filter = target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            (parent.to_path_buf(), filter.or(default_filter))
        };

        let (tx, rx) = channel();
        let mut entries = match registry().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let subscriber_id = if let Some(entry) = entries.get_mut(&directory) {
            let id = entry.next_subscriber_id;
            entry.next_subscriber_id += 1;
            entry.refcount += 1;
            let mut subscribers = match entry.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers.push(Subscriber { id, filter, tx });
            id
        } else {
            let subscribers = Arc::new(Mutex::new(vec![Subscriber { id: 0, filter, tx }]));
            let handler_subscribers = Arc::clone(&subscribers);
            let mut backend = notify::RecommendedWatcher::new(
                move |result: Result<Event, notify::Error>| match result {
                    Ok(event) => dispatch(&handler_subscribers, &event),
                    Err(error) => debug!(%error, "watch backend error"),
                },
                notify::Config::default(),
            )?;
            backend.watch(&directory, RecursiveMode::NonRecursive)?;
            debug!(directory = %directory.display(), "directory watch established");
            entries.insert(
                directory.clone(),
                DirectoryWatcher {
                    _backend: backend,
                    subscribers,
                    refcount: 1,
                    next_subscriber_id: 1,
                },
            );
            0
        };

        Ok(Self {
            directory,
            subscriber_id,
            rx,
            closed: false,
        })
    }

    /// Drains all pending events without blocking.
    pub fn try_events(&mut self) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    /// Closes the subscription, releasing the OS watch when this was the
    /// last subscriber for the directory.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut entries = match registry().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(entry) = entries.get_mut(&self.directory) else {
            return;
        };
        {
            let mut subscribers = match entry.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers.retain(|subscriber| subscriber.id != self.subscriber_id);
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entries.remove(&self.directory);
            debug!(directory = %self.directory.display(), "directory watch released");
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};

    /// Polls a watcher until `predicate` matches an event or the timeout
    /// elapses. Notify delivery is asynchronous.
    fn wait_for(watcher: &mut Watcher, predicate: impl Fn(&WatchEvent) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if watcher.try_events().iter().any(&predicate) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn file_watcher_sees_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.log");
        fs::write(&path, b"initial").unwrap();

        let mut watcher = Watcher::subscribe(&path, None).unwrap();
        fs::write(&path, b"initial plus more").unwrap();

        assert!(
            wait_for(&mut watcher, |e| e.file_name == "data.log"),
            "expected an event for data.log"
        );
        watcher.close();
    }

    #[test]
    fn directory_watcher_filters_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("a.idx");
        fs::write(&watched, b"one").unwrap();
        fs::write(dir.path().join("b.idx"), b"two").unwrap();

        let mut watcher = Watcher::subscribe(&watched, None).unwrap();
        fs::write(dir.path().join("b.idx"), b"changed").unwrap();
        fs::write(&watched, b"changed").unwrap();

        assert!(wait_for(&mut watcher, |e| e.file_name == "a.idx"));
        assert!(watcher.try_events().iter().all(|e| e.file_name == "a.idx"));
    }

    #[test]
    fn refcounted_registry_shares_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = Watcher::subscribe(dir.path(), None).unwrap();
        let mut second = Watcher::subscribe(dir.path(), None).unwrap();
        {
            let entries = registry().lock().unwrap();
            assert_eq!(entries.get(dir.path()).map(|e| e.refcount), Some(2));
        }
        first.close();
        {
            let entries = registry().lock().unwrap();
            assert_eq!(entries.get(dir.path()).map(|e| e.refcount), Some(1));
        }
        second.close();
        {
            let entries = registry().lock().unwrap();
            assert!(!entries.contains_key(dir.path()));
        }
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::subscribe(dir.path(), None).unwrap();
        watcher.close();
        watcher.close();
        assert!(!registry().lock().unwrap().contains_key(dir.path()));
    }

    #[test]
    fn new_files_surface_as_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::subscribe(dir.path(), None).unwrap();
        fs::write(dir.path().join("fresh.log"), b"x").unwrap();
        assert!(wait_for(&mut watcher, |e| {
            e.file_name == "fresh.log" && e.kind == WatchEventKind::Rename
        }));
    }
}
