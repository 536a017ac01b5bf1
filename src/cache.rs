use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::bounds::Bounds;
use crate::error::{GeodataError, Result};
use crate::track::Track;

/// Resolved location of one cache entry. Derived deterministically from a
/// feature-set name and a spatial or track fingerprint; equal inputs always
/// resolve to the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    path: PathBuf,
}

impl CacheHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Disk-backed cache of post-synthesis feature blobs.
///
/// Entries are serde_json blobs, valid forever for a given key: no TTL, no
/// eviction. Staleness is the operator's responsibility (delete the cache
/// directory to force a refresh). Concurrent writers race benignly thanks
/// to atomic tempfile-then-rename writes; readers of a half-written or
/// otherwise unreadable entry fail closed with `CorruptCache`.
#[derive(Debug, Clone)]
pub struct GeoCache {
    root: PathBuf,
}

impl GeoCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Handle for a feature set keyed by geographic extent. Pure path
    /// derivation, does not touch the disk.
    pub fn handle_for_bounds(&self, feature_set_name: &str, bounds: &Bounds) -> CacheHandle {
        self.handle(feature_set_name, &bounds.key_string())
    }

    /// Handle for a feature set keyed by track identity.
    pub fn handle_for_track(&self, feature_set_name: &str, track: &Track) -> CacheHandle {
        self.handle(feature_set_name, &track.fingerprint())
    }

    fn handle(&self, feature_set_name: &str, key_source: &str) -> CacheHandle {
        let digest = Sha256::new_with_prefix(key_source.as_bytes()).finalize();
        let short = &hex::encode(digest)[..16];
        CacheHandle { path: self.root.join(feature_set_name).join(format!("{short}.json")) }
    }

    pub fn exists(&self, handle: &CacheHandle) -> bool {
        handle.path.is_file()
    }

    /// Read and deserialize an entry. Any failure (missing file, I/O error,
    /// blob of the wrong shape) is reported as `CorruptCache`; callers
    /// treat it as a miss and re-derive rather than crash the pipeline.
    pub fn read<T: DeserializeOwned>(&self, handle: &CacheHandle) -> Result<T> {
        let corrupt = |reason: String| GeodataError::CorruptCache {
            path: handle.path.clone(),
            reason,
        };
        let file = File::open(&handle.path).map_err(|e| corrupt(e.to_string()))?;
        serde_json::from_reader(file).map_err(|e| corrupt(e.to_string()))
    }

    /// Serialize and persist an entry atomically (tempfile then rename), so
    /// a concurrent reader never observes a partial blob.
    pub fn write<T: Serialize>(&self, handle: &CacheHandle, value: &T) -> Result<()> {
        let io_err = |reason: String| GeodataError::CacheWrite {
            path: handle.path.clone(),
            reason,
        };

        let parent = handle.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(|e| io_err(e.to_string()))?;

        let tmp = NamedTempFile::new_in(parent).map_err(|e| io_err(e.to_string()))?;
        serde_json::to_writer(tmp.as_file(), value).map_err(|e| io_err(e.to_string()))?;
        tmp.as_file().sync_all().ok(); // best-effort fsync
        tmp.persist(&handle.path).map_err(|e| io_err(e.to_string()))?;

        debug!(path = %handle.path.display(), "cache entry written");
        Ok(())
    }
}
