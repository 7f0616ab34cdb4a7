//! Live-notification source feeding the task queue (§4.7).
//!
//! One non-recursive `notify` watch per watched directory. The engine
//! handles descent itself (§1), so the watcher never asks the OS to recurse.
//! A raw notification for a path inside a watched directory is translated,
//! unclassified, into a task with `watch = true`; the worker is the sole
//! authority on what kind of event that task turns into (§4.7).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::{debug, warn};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::entry::Entry;

/// Invoked with the raw path string of a changed entry inside a watched
/// directory. The engine facade wires this to `WorkerPool::submit`.
pub type NotifyCallback = Arc<dyn Fn(String) + Send + Sync>;

struct Inner {
    callback: NotifyCallback,
    watches: HashMap<String, RecommendedWatcher>,
}

/// Keyed by directory name; owns the underlying watch handle per §5. Dropping
/// the `RecommendedWatcher` cancels that directory's observation.
pub struct OsWatcher {
    inner: Mutex<Inner>,
}

impl OsWatcher {
    pub fn new(callback: NotifyCallback) -> Self {
        OsWatcher {
            inner: Mutex::new(Inner { callback, watches: HashMap::new() }),
        }
    }

    /// `watcher_add`, starts observing a directory; idempotent per name.
    /// Returns `false` if already observed or if `entry` is not a directory.
    pub fn add(&self, entry: &Entry) -> bool {
        if !entry.is_dir() {
            debug!("refusing to watch non-directory {}", entry.name);
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.watches.contains_key(&entry.name) {
            return false;
        }
        let callback = Arc::clone(&inner.callback);
        match start_watch(&entry.name, callback) {
            Ok(watcher) => {
                inner.watches.insert(entry.name.clone(), watcher);
                debug!("watching {}", entry.name);
                true
            }
            Err(e) => {
                warn!("failed to watch {}: {e:#}", entry.name);
                false
            }
        }
    }

    /// `watcher_delete`, stops observing; returns whether anything was removed.
    pub fn delete(&self, entry: &Entry) -> bool {
        self.remove_name(&entry.name)
    }

    pub fn remove_name(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.watches.remove(name).is_some();
        if removed {
            debug!("stopped watching {name}");
        }
        removed
    }

    /// `watcher_clear`, stops all observations.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.watches.clear();
    }

    pub fn is_watching(&self, name: &str) -> bool {
        self.inner.lock().unwrap().watches.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds and arms one non-recursive watch. Kept as a plain `anyhow::Result`
/// helper since its two fallible steps (constructing the backend, then
/// registering the path) have no distinct recovery paths; `add` collapses
/// both into the single bool/log contract the rest of the module exposes.
fn start_watch(path: &str, callback: NotifyCallback) -> anyhow::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for p in event.paths {
                if let Some(s) = p.to_str() {
                    callback(s.to_string());
                }
            }
        }
        Err(e) => warn!("watcher backend error: {e}"),
    })
    .context("constructing recommended watcher")?;
    watcher
        .watch(Path::new(path), RecursiveMode::NonRecursive)
        .with_context(|| format!("registering watch on {path}"))?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::MODE_DIR;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn dir_entry(name: &str) -> Entry {
        Entry { name: name.to_string(), mode: MODE_DIR, size: 0, mtime: 0, watch: true }
    }

    fn file_entry(name: &str) -> Entry {
        Entry { name: name.to_string(), mode: crate::entry::MODE_FILE, size: 0, mtime: 0, watch: false }
    }

    #[test]
    fn add_refuses_non_directories() {
        let watcher = OsWatcher::new(Arc::new(|_| {}));
        assert!(!watcher.add(&file_entry("/tmp/x")));
    }

    #[test]
    fn add_is_idempotent_per_name() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().to_str().unwrap().to_string();
        let watcher = OsWatcher::new(Arc::new(|_| {}));
        assert!(watcher.add(&dir_entry(&name)));
        assert!(!watcher.add(&dir_entry(&name)));
        assert_eq!(watcher.len(), 1);
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().to_str().unwrap().to_string();
        let watcher = OsWatcher::new(Arc::new(|_| {}));
        watcher.add(&dir_entry(&name));
        assert!(watcher.delete(&dir_entry(&name)));
        assert!(!watcher.delete(&dir_entry(&name)));
    }

    #[test]
    fn clear_drops_every_observation() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let watcher = OsWatcher::new(Arc::new(|_| {}));
        watcher.add(&dir_entry(a.path().to_str().unwrap()));
        watcher.add(&dir_entry(b.path().to_str().unwrap()));
        assert_eq!(watcher.len(), 2);
        watcher.clear();
        assert!(watcher.is_empty());
    }

    #[test]
    fn a_raw_notification_reaches_the_callback() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().to_str().unwrap().to_string();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let watcher = OsWatcher::new(Arc::new(move |_path| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(watcher.add(&dir_entry(&name)));

        std::fs::write(dir.path().join("new_file.txt"), b"hi").unwrap();

        let start = std::time::Instant::now();
        while hits.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(hits.load(Ordering::SeqCst) > 0, "expected at least one watcher callback");
    }
}
