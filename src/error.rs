//! Error taxonomy.
//!
//! Each backend concern gets its own error type so callers can decide
//! log-and-continue vs. fail at the orchestrator boundary instead of
//! swallowing errors where they occur. Conversion into the uniform
//! caller-facing failure happens in the HTTP layer.

use thiserror::Error;

/// Configuration loading or validation failure.
///
/// Fatal on first load; on reload the previous snapshot is retained and
/// the error reported to the caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A service failed to acquire its backing resource.
///
/// `Service::connect` rolls the state back to `Disconnected` and
/// propagates this; retrying later is always safe.
#[derive(Debug, Error)]
#[error("{service}: {reason}")]
pub struct ConnectionError {
    pub service: String,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(service: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}

/// Registering a service dependency would close a cycle.
///
/// Raised at registration time, never as a runtime deadlock.
#[derive(Debug, Error)]
#[error("dependency cycle: {}", path.join(" -> "))]
pub struct DependencyCycleError {
    /// The offending path, ending where it started.
    pub path: Vec<String>,
}

/// The document source could not be scanned.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source root does not exist: {0}")]
    MissingRoot(String),
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// An embedding backend call failed.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding backend error: {0}")]
    Api(String),
}

/// An index store operation failed.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("index is not connected")]
    NotConnected,
}

/// One source's re-indexing failed during a sync pass.
///
/// Isolated per source: the pass records it in the report and continues.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("sync pass deadline exceeded")]
    Timeout,
}

/// A cache backend failure. Always downgraded to a miss by the cache
/// itself; never surfaced to callers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// The generation backend failed to produce an answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generation backend error: {0}")]
    Api(String),
    #[error("generation backend is not connected")]
    NotConnected,
}

/// Any component failure observed at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}
