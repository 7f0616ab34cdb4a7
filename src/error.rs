//! Error types for the engine's public surface.
//!
//! Internal helpers are free to return `anyhow::Result`; this type is what
//! crosses the boundary of a public method so callers get a stable, matchable
//! set of variants instead of an opaque chain of causes.

use std::path::PathBuf;

/// The five error kinds the engine can report.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// API misuse: a call made outside its required lifecycle state.
    #[error("usage error: {0}")]
    Usage(String),

    /// A name was looked up that the cache does not hold.
    #[error("not found: {0}")]
    NotFound(String),

    /// stat/open/read/write failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cache file could not be parsed.
    #[error("cache file codec error at {path}: {reason}")]
    Codec { path: PathBuf, reason: String },

    /// The OS watcher backend failed to register or cancel an observation.
    #[error("watcher backend error: {0}")]
    Runtime(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn codec(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        EngineError::Codec {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
