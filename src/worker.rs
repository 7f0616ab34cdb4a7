//! Bounded pool that runs the walk-and-diff routine (§4.6).

use std::fs;
use std::io::ErrorKind;
use std::sync::{Arc, Weak};

use log::{debug, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::cache::Cache;
use crate::entry::Entry;
use crate::filter::FilterRegistry;
use crate::handler::{EventMask, HandlerRegistry};
use crate::queue::TaskQueue;
use crate::watcher::OsWatcher;

struct Shared {
    queue: Arc<TaskQueue>,
    pool: ThreadPool,
    cache: Arc<Cache>,
    filters: Arc<FilterRegistry>,
    handlers: Arc<HandlerRegistry>,
    watcher: Arc<OsWatcher>,
}

/// A cheaply cloneable handle onto the worker pool. Every clone shares the
/// same queue, thread pool, and collaborators; cloning is how a batch being
/// processed on one pool thread gets a handle it can use to `submit` more
/// tasks (directory descent, child rescans) back onto the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

/// A non-owning handle onto a [`WorkerPool`], held by the watcher's notifier
/// thread so that thread does not itself keep the pool (and everything it
/// holds: cache, registries, watcher) alive past `shutdown`.
#[derive(Clone)]
pub struct WeakWorkerPool {
    shared: Weak<Shared>,
}

impl WeakWorkerPool {
    pub fn upgrade(&self) -> Option<WorkerPool> {
        self.shared.upgrade().map(|shared| WorkerPool { shared })
    }
}

impl WorkerPool {
    pub fn downgrade(&self) -> WeakWorkerPool {
        WeakWorkerPool {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn new(
        max_workers: usize,
        queue: Arc<TaskQueue>,
        cache: Arc<Cache>,
        filters: Arc<FilterRegistry>,
        handlers: Arc<HandlerRegistry>,
        watcher: Arc<OsWatcher>,
    ) -> Self {
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_workers.max(1))
            .thread_name(|i| format!("fswarden-worker-{i}"))
            .build()
            .expect("building the bounded worker pool");
        WorkerPool {
            shared: Arc::new(Shared {
                queue,
                pool,
                cache,
                filters,
                handlers,
                watcher,
            }),
        }
    }

    /// `enqueue(entry)` from the caller's perspective: runs dispatcher policy
    /// `F(false)`, spawning a batch onto the pool if this call triggers one.
    pub fn submit(&self, entry: Entry) {
        self.spawn_if_any(self.shared.queue.enqueue(entry));
    }

    /// Used by `shutdown(wait=true)`'s force-dispatch loop.
    pub fn flush(&self) {
        self.spawn_if_any(self.shared.queue.force_flush());
    }

    pub fn wait_idle(&self) {
        self.shared.queue.wait_idle();
    }

    pub fn is_idle(&self) -> bool {
        self.shared.queue.is_idle()
    }

    pub fn failed_snapshot(&self) -> Vec<Entry> {
        self.shared.queue.failed_snapshot()
    }

    fn spawn_if_any(&self, batch: Option<Vec<Entry>>) {
        let Some(batch) = batch else { return };
        let handle = self.clone();
        self.shared.pool.spawn(move || handle.run_batch(batch));
    }

    /// Runs every task in `batch` in enqueue order (§5: ordering is only
    /// guaranteed within one batch), then tells the dispatcher this batch
    /// finished, immediately spawning the next one if policy says to.
    fn run_batch(&self, batch: Vec<Entry>) {
        for task in batch {
            self.process_task(task);
        }
        self.spawn_if_any(self.shared.queue.batch_complete());
    }

    /// The per-task diff algorithm, §4.6 steps 1-7.
    fn process_task(&self, mut task: Entry) {
        let cached = self.shared.cache.get(&task.name);

        let stat = fs::metadata(&task.name);
        let exists = match &stat {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                // A transient I/O error: neither confirm nor deny existence.
                // Per §4.6 edge cases, this must never synthesize a delete.
                warn!("stat failed for {}: {e}", task.name);
                self.shared.queue.mark_failed(task);
                return;
            }
        };

        if !exists {
            match cached {
                Some(cached) => {
                    let event = if cached.is_dir() { EventMask::DIR_DELETED } else { EventMask::FILE_DELETED };
                    self.shared.handlers.dispatch(event, &cached, &self.shared.cache);
                }
                None => self.shared.queue.mark_failed(task),
            }
            return;
        }

        let metadata = stat.expect("checked Ok above");
        task = Entry::from_metadata(task.name, &metadata, task.watch);

        if self.shared.filters.matches(&task) {
            if let Some(cached) = cached {
                let event = if cached.is_dir() { EventMask::DIR_DELETED } else { EventMask::FILE_DELETED };
                self.shared.handlers.dispatch(event, &cached, &self.shared.cache);
            }
            return;
        }

        if task.is_dir() {
            self.process_directory(task, cached);
        } else if task.is_file() {
            self.process_file(task, cached);
        } else {
            debug!("ignoring non-regular, non-directory entry {}", task.name);
        }
    }

    fn process_file(&self, task: Entry, cached: Option<Entry>) {
        let event = match &cached {
            None => Some(EventMask::FILE_CREATED),
            Some(c) if !c.observationally_eq(&task) => Some(EventMask::FILE_CHANGED),
            Some(_) => None,
        };
        if let Some(event) = event {
            self.shared.handlers.dispatch(event, &task, &self.shared.cache);
        }
    }

    fn process_directory(&self, task: Entry, cached: Option<Entry>) {
        let event = match &cached {
            None => Some(EventMask::DIR_CREATED),
            Some(c) if !c.observationally_eq(&task) => Some(EventMask::DIR_CHANGED),
            Some(_) => None,
        };

        // Re-enqueue cached children *before* reading the live directory, so
        // vanished entries are confirmed DELETED even if the live read is
        // slow to return or the directory has new entries filling the queue
        // first (§4.6 edge-case policy).
        for child in self.shared.cache.direct_children(&task.name) {
            if child.name != task.name {
                self.submit(Entry::pending(child.name.clone(), child.watch));
            }
        }

        match fs::read_dir(&task.name) {
            Ok(read_dir) => {
                for dirent in read_dir.flatten() {
                    let child_name = dirent.path().to_string_lossy().into_owned();
                    let watch = self
                        .shared
                        .cache
                        .get(&child_name)
                        .map(|e| e.watch)
                        .unwrap_or(task.watch);
                    self.submit(Entry::pending(child_name, watch));
                }
            }
            Err(e) => {
                warn!("failed to read directory {}: {e}", task.name);
            }
        }

        if task.watch {
            self.shared.watcher.add(&task);
        }

        if let Some(event) = event {
            self.shared.handlers.dispatch(event, &task, &self.shared.cache);
        }
    }
}
