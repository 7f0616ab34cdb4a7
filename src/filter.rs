//! Regex-keyed predicate registry gating which entries the worker processes.

use std::collections::HashMap;
use std::sync::Mutex;

use log::warn;
use regex::Regex;

use crate::entry::Entry;

/// A pure predicate over an entry. Represented as a plain function pointer
/// (not a boxed closure) so registration and unregistration can compare
/// identity by equality, the way the callback is compared in the original
/// registry (see the design notes on dynamic dispatch via function
/// pointers). A function pointer plus no captured state is the simplest of
/// the two acceptable shapes.
pub type FilterPredicate = fn(&Entry) -> bool;

struct FilterEntry {
    is_dir: bool,
    predicate: Option<FilterPredicate>,
}

struct Registration {
    regex: Regex,
    entries: Vec<FilterEntry>,
}

/// A map from compiled regex to an ordered list of (is-directory, predicate)
/// pairs, keyed by the original pattern text.
pub struct FilterRegistry {
    inner: Mutex<HashMap<String, Registration>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        FilterRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Compiles `pattern` and associates `(is_dir, predicate)` with it.
    /// Re-registration with the same pattern text appends to the same list.
    /// A regex compile failure is a warning, not an error, and the
    /// registration is refused (§7).
    pub fn register(&self, is_dir: bool, pattern: &str, predicate: Option<FilterPredicate>) -> bool {
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => {
                warn!("refusing filter registration, bad pattern {pattern:?}: {e}");
                return false;
            }
        };
        let mut inner = self.inner.lock().unwrap();
        let registration = inner.entry(pattern.to_string()).or_insert_with(|| Registration {
            regex,
            entries: Vec::new(),
        });
        registration.entries.push(FilterEntry { is_dir, predicate });
        true
    }

    /// Removes the matching `(is_dir, predicate)` entry and prunes the
    /// pattern entirely if its list becomes empty.
    pub fn unregister(&self, is_dir: bool, pattern: &str, predicate: Option<FilterPredicate>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(registration) = inner.get_mut(pattern) else {
            return false;
        };
        let position = registration
            .entries
            .iter()
            .position(|e| e.is_dir == is_dir && e.predicate == predicate);
        let Some(position) = position else {
            return false;
        };
        registration.entries.remove(position);
        if registration.entries.is_empty() {
            inner.remove(pattern);
        }
        true
    }

    /// Iterates all registered patterns; for each whose regex matches
    /// `entry.name`, iterates its `(is_dir, predicate)` entries. First match
    /// wins. A null predicate is a pure pattern filter.
    pub fn matches(&self, entry: &Entry) -> bool {
        let inner = self.inner.lock().unwrap();
        for registration in inner.values() {
            if !registration.regex.is_match(&entry.name) {
                continue;
            }
            for candidate in &registration.entries {
                if candidate.is_dir != entry.is_dir() {
                    continue;
                }
                match candidate.predicate {
                    None => return true,
                    Some(predicate) => {
                        if predicate(entry) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
