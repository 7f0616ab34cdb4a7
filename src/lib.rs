//! fswarden: a deterministic, non-recursive filesystem monitoring engine.
//!
//! Keeps an in-memory snapshot of a set of directory trees, reconciles it
//! against the live filesystem with a bounded worker pool, and notifies
//! typed create/change/delete events to registered handlers. OS-level
//! directory watches close the loop so later changes are noticed without a
//! re-walk.

pub mod cache;
pub mod engine;
pub mod entry;
pub mod error;
pub mod filter;
pub mod handler;
pub mod queue;
pub mod trie;
pub mod watcher;
pub mod worker;

pub use cache::Cache;
pub use engine::{Engine, EngineConfig};
pub use entry::{Entry, MODE_DIR, MODE_FILE};
pub use error::EngineError;
pub use filter::{FilterPredicate, FilterRegistry};
pub use handler::{EventMask, HandlerCallback, HandlerId, HandlerRegistry};
pub use queue::TaskQueue;
pub use watcher::{NotifyCallback, OsWatcher};
pub use worker::WorkerPool;
