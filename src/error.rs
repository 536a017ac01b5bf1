use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the acquisition/caching/synthesis core.
///
/// `Upstream` and `CorruptCache` are operational: the first aborts the
/// current build, the second is treated as a cache miss by the pipelines.
/// `MissingCache` signals a broken internal invariant and is fatal. The
/// remaining variants indicate misuse of the batching API.
#[derive(Debug, Error)]
pub enum GeodataError {
    /// Network or service failure while talking to the Overpass API.
    /// Not retried internally; retrying a large merged query is the
    /// caller's call.
    #[error("overpass request failed: {0}")]
    Upstream(String),

    /// A cache blob exists but cannot be deserialized into the expected
    /// shape. Callers treat this as a cache miss and re-derive.
    #[error("cache entry {path} is unreadable: {reason}")]
    CorruptCache { path: PathBuf, reason: String },

    /// A pipeline believed a feature set was already cached but found no
    /// entry on disk. Internal-consistency violation, not recovered.
    #[error("feature set {0:?} was reported cached but no usable cache entry exists")]
    MissingCache(String),

    /// Failed to persist a cache entry.
    #[error("cache write to {path} failed: {reason}")]
    CacheWrite { path: PathBuf, reason: String },

    /// The name was never registered with the batcher.
    #[error("unknown sub-query name {0:?}")]
    UnknownName(String),

    /// A non-cached sub-query result was requested before `launch`.
    #[error("sub-query {0:?} requested before the batch was launched")]
    NotLaunched(String),

    /// The name is already taken within the current batch.
    #[error("sub-query name {0:?} already registered in this batch")]
    DuplicateName(String),
}

impl From<reqwest::Error> for GeodataError {
    fn from(err: reqwest::Error) -> Self {
        GeodataError::Upstream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GeodataError>;
