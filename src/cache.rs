//! Thread-safe trie of entry records, plus the on-disk codec from §6.4.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use log::{debug, error};

use crate::entry::Entry;
use crate::error::EngineError;
use crate::trie::Trie;

const PATH_SEPARATOR: &str = std::path::MAIN_SEPARATOR_STR;

struct Inner {
    trie: Trie,
    count: usize,
}

/// A path trie of entry records plus a coarse mutex and a live count of
/// carrying nodes. Every public operation takes the one lock; none of them
/// perform file or stat I/O (`load`/`save` are the exception, and they are
/// only ever called from the engine facade during `init`/`shutdown`, never
/// from a worker holding other locks).
pub struct Cache {
    inner: Mutex<Inner>,
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            inner: Mutex::new(Inner {
                trie: Trie::new(PATH_SEPARATOR),
                count: 0,
            }),
        }
    }

    /// Read-only lookup. Returns an owned copy rather than a borrow tied to
    /// the lock guard's lifetime. The mutex makes a true borrowed reference
    /// impractical to hand back through `&self`, and a clone is cheap for a
    /// metadata-sized record.
    pub fn get(&self, name: &str) -> Option<Entry> {
        self.inner.lock().unwrap().trie.find(name).cloned()
    }

    /// Inserts a deep copy of `entry`, replacing any existing record at that
    /// name.
    pub fn add(&self, entry: Entry) {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.trie.find(&entry.name).is_some();
        inner.trie.add(&entry.name, entry);
        if !existed {
            inner.count += 1;
        }
    }

    /// Removes the record at `name` only; descendants are retained, since
    /// cascading deletion is the worker's job (it notices vanished children
    /// one diff at a time). Fails if absent.
    pub fn delete(&self, name: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.trie.clear_payload(name) {
            Some(_) => {
                inner.count -= 1;
                Ok(())
            }
            None => Err(EngineError::NotFound(name.to_string())),
        }
    }

    /// Removes `name` and every descendant in one structural operation. Used
    /// only by the engine facade's `delete`/`clear`, which are specified to
    /// remove a whole subtree; the public, non-cascading `delete` above is
    /// what §4.2 actually describes.
    pub fn remove_subtree(&self, name: &str) -> Vec<Entry> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.trie.delete_subtree(name);
        inner.count = inner.count.saturating_sub(removed.len());
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.trie.clear();
        inner.count = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flips `name`'s watch flag in place. Returns `false` if `name` is
    /// unknown.
    pub fn set_watch(&self, name: &str, watch: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.trie.find(name).cloned() {
            Some(mut entry) => {
                entry.watch = watch;
                inner.trie.add(name, entry);
                true
            }
            None => false,
        }
    }

    pub fn foreach_top(&self, mut visitor: impl FnMut(&Entry)) {
        self.inner.lock().unwrap().trie.foreach_top(|e| visitor(e));
    }

    pub fn foreach_child(&self, name: &str, mut visitor: impl FnMut(&Entry)) {
        self.inner
            .lock()
            .unwrap()
            .trie
            .foreach_subtree(name, |e| visitor(e));
    }

    /// The direct cached children of the directory at `name` (not the whole
    /// subtree). What the worker re-enqueues to notice deletions below a
    /// directory it is re-diffing (§4.6 step 5).
    pub fn direct_children(&self, name: &str) -> Vec<Entry> {
        self.inner.lock().unwrap().trie.direct_children(name)
    }

    /// `load(path)`. Cache-load errors are reported critical and the
    /// engine continues with an empty cache (§7); this function itself just
    /// returns the error, the caller (the engine facade) is responsible for
    /// swallowing it per that policy.
    pub fn load(&self, path: &Path) -> Result<(), EngineError> {
        let file = fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
        let reader = BufReader::new(file);
        let mut inner = self.inner.lock().unwrap();
        let mut in_entries_section = false;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| EngineError::io(path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') {
                in_entries_section = line == "[entries]";
                continue;
            }
            if !in_entries_section {
                continue;
            }
            let entry = parse_entry_line(line)
                .ok_or_else(|| EngineError::codec(path, format!("malformed line {}", lineno + 1)))?;
            inner.trie.add(&entry.name, entry);
            inner.count += 1;
        }
        debug!("loaded cache from {}", path.display());
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let mut file = fs::File::create(path).map_err(|e| EngineError::io(path, e))?;
        writeln!(file, "[entries]").map_err(|e| EngineError::io(path, e))?;
        let mut write_err = None;
        {
            let inner = self.inner.lock().unwrap();
            inner.trie.foreach(|entry| {
                if write_err.is_some() {
                    return;
                }
                if let Err(e) = writeln!(
                    file,
                    "{} = {};{};{};{}",
                    entry.name,
                    entry.mode,
                    entry.size,
                    entry.mtime,
                    if entry.watch { 1 } else { 0 }
                ) {
                    write_err = Some(e);
                }
            });
        }
        if let Some(e) = write_err {
            error!("failed writing cache file {}: {e}", path.display());
            return Err(EngineError::io(path, e));
        }
        debug!("saved cache to {}", path.display());
        Ok(())
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_entry_line(line: &str) -> Option<Entry> {
    let (name, rest) = line.split_once('=')?;
    let name = name.trim();
    let rest = rest.trim();
    let mut fields = rest.splitn(4, ';');
    let mode: u32 = fields.next()?.trim().parse().ok()?;
    let size: u64 = fields.next()?.trim().parse().ok()?;
    let mtime: u64 = fields.next()?.trim().parse().ok()?;
    let watch_raw: u8 = fields.next()?.trim().parse().ok()?;
    if name.is_empty() {
        return None;
    }
    Some(Entry {
        name: name.to_string(),
        mode,
        size,
        mtime,
        watch: watch_raw != 0,
    })
}
