//! Lifecycle, public entry points, and coordination (§4.8).

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error};

use crate::cache::Cache;
use crate::entry::Entry;
use crate::error::EngineError;
use crate::filter::{FilterPredicate, FilterRegistry};
use crate::handler::{EventMask, HandlerCallback, HandlerId, HandlerRegistry};
use crate::queue::TaskQueue;
use crate::watcher::OsWatcher;
use crate::worker::WorkerPool;

/// Explicit, in-process tunables the engine owns (§6.5, §10.4). There is
/// deliberately no environment-variable or config-file layer backing this;
/// every value here is a constructor argument.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub max_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { batch_size: 20, max_workers: 3 }
    }
}

struct Context {
    cache: Arc<Cache>,
    filters: Arc<FilterRegistry>,
    handlers: Arc<HandlerRegistry>,
    watcher: Arc<OsWatcher>,
    pool: WorkerPool,
    notifier: thread::JoinHandle<()>,
}

/// A process-wide monitoring context. §9's design note prefers an explicit
/// handle over a lazily initialised global singleton; `Engine::new` returns
/// one, empty, and `init` populates it.
pub struct Engine {
    context: Mutex<Option<Context>>,
}

impl Engine {
    pub fn new() -> Self {
        Engine { context: Mutex::new(None) }
    }

    /// Initialises cache, registries, watcher, and worker pool; loads
    /// `cache_path` if given; enqueues one task per top-level cache entry so
    /// the first pass validates on-disk state. A second `init` before
    /// `shutdown` is API misuse.
    pub fn init(&self, cache_path: Option<&Path>, config: EngineConfig) -> Result<(), EngineError> {
        let mut context = self.context.lock().unwrap();
        if context.is_some() {
            error!("init called while already initialized");
            return Err(EngineError::Usage("engine already initialized".into()));
        }

        let cache = Arc::new(Cache::new());
        if let Some(path) = cache_path {
            if let Err(e) = cache.load(path) {
                error!("cache load failed, starting empty: {e}");
                cache.clear();
            }
        }

        let filters = Arc::new(FilterRegistry::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let queue = Arc::new(TaskQueue::new(config.batch_size));

        // The watcher forwards raw path notifications through a channel
        // rather than holding a direct reference to the pool, which would
        // otherwise be a construction cycle (the pool needs the watcher to
        // register directories, the watcher needs the pool to requeue).
        let (tx, rx) = mpsc::channel::<String>();
        let watcher = Arc::new(OsWatcher::new(Arc::new(move |path| {
            if tx.send(path).is_err() {
                debug!("watcher notification dropped: engine shutting down");
            }
        })));

        let pool = WorkerPool::new(
            config.max_workers,
            queue,
            Arc::clone(&cache),
            Arc::clone(&filters),
            Arc::clone(&handlers),
            Arc::clone(&watcher),
        );

        // Only a weak handle crosses into the notifier thread: a strong one
        // would keep `Shared` (and so `watcher`, and so `tx`) alive for as
        // long as the thread runs, and the thread's `for path in rx` loop
        // only ends once every `tx` clone is gone. `shutdown` drops the
        // strong handles and then joins this thread.
        let weak_pool = pool.downgrade();
        let notifier = thread::spawn(move || {
            for path in rx {
                match weak_pool.upgrade() {
                    Some(pool) => pool.submit(Entry::pending(path, true)),
                    None => break,
                }
            }
        });

        cache.foreach_top(|entry| pool.submit(entry.clone()));

        *context = Some(Context { cache, filters, handlers, watcher, pool, notifier });
        Ok(())
    }

    /// If `wait`, forces a dispatch of whatever is pending and blocks until
    /// the pool is quiescent (§10.6), then saves the cache (if a path is
    /// given) and tears down watcher, registries, cache, and pool. The
    /// watcher's notifier thread is joined last, after every strong handle
    /// to it has been dropped, so `Shared` and its pool actually deallocate
    /// instead of leaking across `init`/`shutdown` cycles.
    pub fn shutdown(&self, cache_path: Option<&Path>, wait: bool) -> Result<(), EngineError> {
        let ctx = {
            let mut context = self.context.lock().unwrap();
            let Some(ctx) = context.take() else {
                error!("shutdown called before init");
                return Err(EngineError::Usage("engine not initialized".into()));
            };
            ctx
        };

        if wait {
            ctx.pool.flush();
            ctx.pool.wait_idle();
        }

        if let Some(path) = cache_path {
            if let Err(e) = ctx.cache.save(path) {
                error!("failed saving cache to {}: {e}", path.display());
            }
        }

        let Context { cache, filters, handlers, watcher, pool, notifier } = ctx;
        watcher.clear();
        drop(pool);
        drop(watcher);
        drop(cache);
        drop(filters);
        drop(handlers);

        if notifier.join().is_err() {
            error!("watcher notifier thread panicked during shutdown");
        }
        Ok(())
    }

    /// Normalises `name` (strips a trailing separator); if absent from the
    /// cache, constructs an entry and enqueues it with `watch`. A no-op if
    /// already present.
    pub fn add(&self, name: &str, watch: bool) -> Result<(), EngineError> {
        let context = self.context.lock().unwrap();
        let Some(ctx) = context.as_ref() else {
            error!("add called before init");
            return Err(EngineError::Usage("engine not initialized".into()));
        };
        let normalized = normalize(name);
        if ctx.cache.get(&normalized).is_some() {
            return Ok(());
        }
        ctx.pool.submit(Entry::pending(normalized, watch));
        Ok(())
    }

    /// Blocks until the pool is quiescent, then removes `name` and every
    /// descendant from the cache.
    pub fn delete(&self, name: &str) -> Result<(), EngineError> {
        let context = self.context.lock().unwrap();
        let Some(ctx) = context.as_ref() else {
            error!("delete called before init");
            return Err(EngineError::Usage("engine not initialized".into()));
        };
        ctx.pool.wait_idle();
        ctx.cache.remove_subtree(&normalize(name));
        Ok(())
    }

    /// Blocks until the pool is quiescent, then empties the cache and the watcher.
    pub fn clear(&self) -> Result<(), EngineError> {
        let context = self.context.lock().unwrap();
        let Some(ctx) = context.as_ref() else {
            error!("clear called before init");
            return Err(EngineError::Usage("engine not initialized".into()));
        };
        ctx.pool.wait_idle();
        ctx.cache.clear();
        ctx.watcher.clear();
        Ok(())
    }

    /// Flips a cached entry's watch flag and (un)registers it with the
    /// watcher accordingly. Fails if `name` is unknown.
    pub fn set_watch(&self, name: &str, watch: bool) -> Result<(), EngineError> {
        let context = self.context.lock().unwrap();
        let Some(ctx) = context.as_ref() else {
            error!("set_watch called before init");
            return Err(EngineError::Usage("engine not initialized".into()));
        };
        let normalized = normalize(name);
        if !ctx.cache.set_watch(&normalized, watch) {
            error!("set_watch: {normalized} not found in cache");
            return Err(EngineError::NotFound(normalized));
        }
        if watch {
            if let Some(entry) = ctx.cache.get(&normalized) {
                ctx.watcher.add(&entry);
            }
        } else {
            ctx.watcher.remove_name(&normalized);
        }
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        let context = self.context.lock().unwrap();
        match context.as_ref() {
            Some(ctx) => ctx.cache.get(&normalize(name)).is_some(),
            None => {
                error!("has called before init");
                false
            }
        }
    }

    /// Registers a handler callback for every event bit set in `mask`.
    pub fn register_handler(&self, mask: EventMask, callback: HandlerCallback) -> Result<HandlerId, EngineError> {
        let context = self.context.lock().unwrap();
        let Some(ctx) = context.as_ref() else {
            error!("register_handler called before init");
            return Err(EngineError::Usage("engine not initialized".into()));
        };
        Ok(ctx.handlers.register(mask, callback))
    }

    pub fn unregister_handler(&self, mask: EventMask, id: HandlerId) -> Result<(), EngineError> {
        let context = self.context.lock().unwrap();
        let Some(ctx) = context.as_ref() else {
            error!("unregister_handler called before init");
            return Err(EngineError::Usage("engine not initialized".into()));
        };
        ctx.handlers.unregister(mask, id);
        Ok(())
    }

    /// Registers a filter predicate; `false` means the pattern failed to
    /// compile and the registration was refused (logged at warn by the
    /// registry itself).
    pub fn register_filter(
        &self,
        is_dir: bool,
        pattern: &str,
        predicate: Option<FilterPredicate>,
    ) -> Result<bool, EngineError> {
        let context = self.context.lock().unwrap();
        let Some(ctx) = context.as_ref() else {
            error!("register_filter called before init");
            return Err(EngineError::Usage("engine not initialized".into()));
        };
        Ok(ctx.filters.register(is_dir, pattern, predicate))
    }

    pub fn unregister_filter(
        &self,
        is_dir: bool,
        pattern: &str,
        predicate: Option<FilterPredicate>,
    ) -> Result<bool, EngineError> {
        let context = self.context.lock().unwrap();
        let Some(ctx) = context.as_ref() else {
            error!("unregister_filter called before init");
            return Err(EngineError::Usage("engine not initialized".into()));
        };
        Ok(ctx.filters.unregister(is_dir, pattern, predicate))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Strips a trailing path separator, except when `name` names the root.
fn normalize(name: &str) -> String {
    let sep = std::path::MAIN_SEPARATOR;
    if name.len() > 1 && name.ends_with(sep) {
        name.trim_end_matches(sep).to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn wait_for<F: Fn() -> bool>(predicate: F) -> bool {
        let start = std::time::Instant::now();
        while !predicate() {
            if start.elapsed() > Duration::from_secs(5) {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        true
    }

    #[test]
    fn second_init_before_shutdown_is_an_error() {
        let engine = Engine::new();
        engine.init(None, EngineConfig::default()).unwrap();
        let result = engine.init(None, EngineConfig::default());
        assert!(matches!(result, Err(EngineError::Usage(_))));
        engine.shutdown(None, true).unwrap();
    }

    #[test]
    fn add_before_init_is_a_logged_no_op_error() {
        let engine = Engine::new();
        let result = engine.add("/tmp/x", false);
        assert!(matches!(result, Err(EngineError::Usage(_))));
    }

    #[test]
    fn scenario_1_new_file_yields_single_file_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, b"0123456789").unwrap();
        let name = path.to_str().unwrap().to_string();

        let engine = Engine::new();
        engine.init(None, EngineConfig::default()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        engine
            .register_handler(EventMask::FILE_CREATED, Arc::new(move |_, _| { h.fetch_add(1, Ordering::SeqCst); true }))
            .unwrap();

        engine.add(&name, false).unwrap();
        assert!(wait_for(|| engine.has(&name)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        engine.shutdown(None, true).unwrap();
    }

    #[test]
    fn scenario_2_and_3_changed_then_deleted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, b"0123456789").unwrap();
        let name = path.to_str().unwrap().to_string();

        let engine = Engine::new();
        engine.init(None, EngineConfig::default()).unwrap();
        let changed = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&changed);
        engine.register_handler(EventMask::FILE_CHANGED, Arc::new(move |_, _| { c.fetch_add(1, Ordering::SeqCst); true })).unwrap();
        let d = Arc::clone(&deleted);
        engine.register_handler(EventMask::FILE_DELETED, Arc::new(move |_, _| { d.fetch_add(1, Ordering::SeqCst); true })).unwrap();

        engine.add(&name, false).unwrap();
        assert!(wait_for(|| engine.has(&name)));

        thread::sleep(Duration::from_millis(20));
        fs::write(&path, b"a longer body than before").unwrap();
        engine.add(&name, false).unwrap();
        assert!(wait_for(|| changed.load(Ordering::SeqCst) == 1));

        fs::remove_file(&path).unwrap();
        engine.add(&name, false).unwrap();
        assert!(wait_for(|| deleted.load(Ordering::SeqCst) == 1));
        assert!(!engine.has(&name));

        engine.shutdown(None, true).unwrap();
    }

    #[test]
    fn scenario_7_save_load_round_trip_suppresses_redundant_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, b"0123456789").unwrap();
        let name = path.to_str().unwrap().to_string();
        let cache_file = dir.path().join("cache.txt");

        {
            let engine = Engine::new();
            engine.init(None, EngineConfig::default()).unwrap();
            engine.add(&name, false).unwrap();
            assert!(wait_for(|| engine.has(&name)));
            engine.shutdown(Some(&cache_file), true).unwrap();
        }

        let engine = Engine::new();
        engine.init(Some(&cache_file), EngineConfig::default()).unwrap();
        let created = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&created);
        engine.register_handler(EventMask::FILE_CREATED, Arc::new(move |_, _| { c.fetch_add(1, Ordering::SeqCst); true })).unwrap();

        // `init` already enqueued a validation task for every loaded
        // top-level entry; give the pool time to run it and confirm no
        // FILE_CREATED fires for a file the cache already knew about.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert!(engine.has(&name));

        engine.shutdown(None, true).unwrap();
    }

    #[test]
    fn set_watch_fails_for_unknown_name() {
        let engine = Engine::new();
        engine.init(None, EngineConfig::default()).unwrap();
        let result = engine.set_watch("/tmp/never-added", true);
        assert!(matches!(result, Err(EngineError::NotFound(_))));
        engine.shutdown(None, true).unwrap();
    }

    #[test]
    fn normalize_strips_trailing_separator_but_keeps_root() {
        let sep = std::path::MAIN_SEPARATOR;
        assert_eq!(normalize(&format!("/tmp/d{sep}")), "/tmp/d");
        assert_eq!(normalize(&sep.to_string()), sep.to_string());
    }
}
