//! Event-mask keyed list of user callbacks (§4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use log::debug;

use crate::cache::Cache;
use crate::entry::Entry;

bitflags! {
    /// The six event bits of §6.3, plus the union masks used for registration.
    /// A dispatched event is always exactly one bit; a registration mask may
    /// carry several.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const NONE = 0;
        const DIR_CREATED = 1;
        const DIR_DELETED = 2;
        const DIR_CHANGED = 4;
        const FILE_CREATED = 8;
        const FILE_DELETED = 16;
        const FILE_CHANGED = 32;
        const DIR_ALL = Self::DIR_CREATED.bits() | Self::DIR_DELETED.bits() | Self::DIR_CHANGED.bits();
        const FILE_ALL = Self::FILE_CREATED.bits() | Self::FILE_DELETED.bits() | Self::FILE_CHANGED.bits();
        const ALL = Self::DIR_ALL.bits() | Self::FILE_ALL.bits();
    }
}

const SINGLE_BITS: [EventMask; 6] = [
    EventMask::DIR_CREATED,
    EventMask::DIR_DELETED,
    EventMask::DIR_CHANGED,
    EventMask::FILE_CREATED,
    EventMask::FILE_DELETED,
    EventMask::FILE_CHANGED,
];

impl EventMask {
    fn is_deletion(self) -> bool {
        self == EventMask::DIR_DELETED || self == EventMask::FILE_DELETED
    }
}

/// A user callback. Closures are allowed to capture their own state, which
/// is this crate's idiomatic stand-in for the C API's `(callback, user_data)`
/// pair (see the design notes on untyped user-data pointers). A Rust
/// closure's captures are its user data, typed instead of erased to `void*`.
pub type HandlerCallback = Arc<dyn Fn(&Entry, EventMask) -> bool + Send + Sync>;

/// Token identifying one registration, returned by `register` and consumed
/// by `unregister`. Closures have no stable identity to compare by (unlike
/// the bare function pointers [`crate::filter::FilterRegistry`] uses), so
/// unregistration is keyed by this token instead of the callback value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    callback: HandlerCallback,
}

/// A map from single event bit to an ordered list of registrations.
pub struct HandlerRegistry {
    lists: Mutex<HashMap<EventMask, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            lists: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// For every bit set in `mask`, appends `callback` to that bit's list.
    pub fn register(&self, mask: EventMask, callback: HandlerCallback) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut lists = self.lists.lock().unwrap();
        for &bit in &SINGLE_BITS {
            if mask.contains(bit) {
                lists
                    .entry(bit)
                    .or_default()
                    .push(Registration { id, callback: Arc::clone(&callback) });
            }
        }
        id
    }

    /// Removes `id`'s registration from every list selected by `mask`.
    pub fn unregister(&self, mask: EventMask, id: HandlerId) {
        let mut lists = self.lists.lock().unwrap();
        for &bit in &SINGLE_BITS {
            if !mask.contains(bit) {
                continue;
            }
            if let Some(list) = lists.get_mut(&bit) {
                if let Some(pos) = list.iter().position(|r| r.id == id) {
                    list.remove(pos);
                }
            }
        }
    }

    /// Invokes every callback registered for `event`, in registration order,
    /// while the registry lock is held (§5); a callback returning `false` is
    /// dropped from the list. Afterward, applies the cache mutation §4.4
    /// specifies for `event`: `cache.add` for CREATED/CHANGED,
    /// `cache.delete` for DELETED, with the registry lock already released.
    pub fn dispatch(&self, event: EventMask, entry: &Entry, cache: &Cache) {
        {
            let mut lists = self.lists.lock().unwrap();
            if let Some(list) = lists.get_mut(&event) {
                list.retain(|reg| (reg.callback)(entry, event));
            }
        }
        if event.is_deletion() {
            if cache.delete(&entry.name).is_err() {
                debug!("{} already absent from cache at dispatch time", entry.name);
            }
        } else {
            cache.add(entry.clone());
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::MODE_FILE;
    use std::sync::atomic::AtomicUsize;

    fn file_entry(name: &str) -> Entry {
        Entry { name: name.to_string(), mode: MODE_FILE, size: 10, mtime: 1000, watch: false }
    }

    #[test]
    fn dispatch_invokes_callbacks_in_registration_order() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        registry.register(
            EventMask::FILE_CREATED,
            Arc::new(move |_, _| {
                a.lock().unwrap().push("a");
                true
            }),
        );
        let b = Arc::clone(&seen);
        registry.register(
            EventMask::FILE_CREATED,
            Arc::new(move |_, _| {
                b.lock().unwrap().push("b");
                true
            }),
        );
        let cache = Cache::new();
        registry.dispatch(EventMask::FILE_CREATED, &file_entry("/tmp/x"), &cache);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn callback_returning_false_is_unregistered() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        registry.register(
            EventMask::FILE_CHANGED,
            Arc::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );
        let cache = Cache::new();
        registry.dispatch(EventMask::FILE_CHANGED, &file_entry("/tmp/x"), &cache);
        registry.dispatch(EventMask::FILE_CHANGED, &file_entry("/tmp/x"), &cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_unregister_round_trip_restores_starting_state() {
        let registry = HandlerRegistry::new();
        let id = registry.register(EventMask::ALL, Arc::new(|_, _| true));
        registry.unregister(EventMask::ALL, id);
        let cache = Cache::new();
        // No panics, no callback invoked: the list for every bit is empty again.
        registry.dispatch(EventMask::FILE_CREATED, &file_entry("/tmp/x"), &cache);
        assert!(cache.get("/tmp/x").is_none());
    }

    #[test]
    fn created_mutates_cache_via_add() {
        let registry = HandlerRegistry::new();
        let cache = Cache::new();
        registry.dispatch(EventMask::FILE_CREATED, &file_entry("/tmp/x"), &cache);
        assert!(cache.get("/tmp/x").unwrap().observationally_eq(&file_entry("/tmp/x")));
    }

    #[test]
    fn deleted_mutates_cache_via_delete() {
        let registry = HandlerRegistry::new();
        let cache = Cache::new();
        cache.add(file_entry("/tmp/x"));
        registry.dispatch(EventMask::FILE_DELETED, &file_entry("/tmp/x"), &cache);
        assert!(cache.get("/tmp/x").is_none());
    }

    #[test]
    fn registering_a_mask_fans_out_to_every_selected_bit() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        registry.register(
            EventMask::DIR_ALL,
            Arc::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );
        let cache = Cache::new();
        registry.dispatch(EventMask::DIR_CREATED, &file_entry("/tmp/d"), &cache);
        registry.dispatch(EventMask::DIR_CHANGED, &file_entry("/tmp/d"), &cache);
        registry.dispatch(EventMask::DIR_DELETED, &file_entry("/tmp/d"), &cache);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
