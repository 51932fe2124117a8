//! Layer cache index.
//!
//! Maps a step's cache key to the layer it produced. The layer bytes live in
//! the [`CasStore`]; this index only records which blob a key resolved to, so
//! an entry whose blob has disappeared is treated as a miss.

use crate::builder::cas::CasStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Manages the key → layer index.
#[derive(Debug, Clone)]
pub struct CacheManager {
    /// Directory holding one metadata file per key
    cache_dir: PathBuf,
    /// Maximum indexed layer size in bytes
    size_limit: u64,
    cas: CasStore,
}

/// Metadata for a cached layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMetadata {
    /// Cache key (SHA256 hex)
    pub cache_key: String,
    /// CAS digest of the layer tarball; `None` when the step changed nothing
    pub layer_digest: Option<String>,
    /// Size of the layer tarball in bytes
    pub size_bytes: u64,
    /// When this layer was created (Unix millis)
    pub created_at: u64,
    /// Last time this layer was used (Unix millis, for LRU)
    pub last_accessed: u64,
    /// Build step description (for debugging)
    pub step_description: String,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookupResult {
    Hit(LayerMetadata),
    Miss,
}

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize/deserialize metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Cache directory not accessible: {0}")]
    CacheDirectoryError(String),
}

impl CacheManager {
    /// Creates a cache manager over `cache_dir`, resolving layers in `cas`.
    pub fn with_config(cache_dir: PathBuf, size_limit: u64, cas: CasStore) -> Result<Self, CacheError> {
        fs::create_dir_all(&cache_dir).map_err(|e| {
            CacheError::CacheDirectoryError(format!("Failed to create {}: {}", cache_dir.display(), e))
        })?;

        Ok(Self { cache_dir, size_limit, cas })
    }

    pub fn cas(&self) -> &CasStore {
        &self.cas
    }

    /// Looks up a layer by cache key, refreshing its access time on a hit.
    pub fn lookup(&self, cache_key: &str) -> Result<CacheLookupResult, CacheError> {
        let metadata_path = self.metadata_path(cache_key)?;
        if !metadata_path.exists() {
            debug!(key = %cache_key, "Cache miss");
            return Ok(CacheLookupResult::Miss);
        }

        let mut metadata = match self.load_metadata(cache_key) {
            Ok(m) => m,
            Err(e) => {
                warn!(key = %cache_key, error = %e, "Discarding unreadable cache entry");
                self.remove(cache_key)?;
                return Ok(CacheLookupResult::Miss);
            }
        };

        if let Some(digest) = &metadata.layer_digest {
            if !self.cas.blob_exists(digest) {
                warn!(key = %cache_key, digest = %digest, "Cached layer blob missing, treating as miss");
                self.remove(cache_key)?;
                return Ok(CacheLookupResult::Miss);
            }
        }

        metadata.last_accessed = current_timestamp();
        self.save_metadata(&metadata)?;

        debug!(key = %cache_key, step = %metadata.step_description, "Cache hit");
        Ok(CacheLookupResult::Hit(metadata))
    }

    /// Records that `cache_key` produced `layer_digest` (already in the CAS).
    pub fn insert(
        &self,
        cache_key: &str,
        layer_digest: Option<String>,
        size_bytes: u64,
        step_description: String,
    ) -> Result<LayerMetadata, CacheError> {
        let now = current_timestamp();
        let metadata = LayerMetadata {
            cache_key: cache_key.to_string(),
            layer_digest,
            size_bytes,
            created_at: now,
            last_accessed: now,
            step_description,
        };

        self.save_metadata(&metadata)?;
        info!(key = %cache_key, size = size_bytes, step = %metadata.step_description, "Cached layer");

        Ok(metadata)
    }

    /// Removes a key from the index. The blob stays until garbage collection.
    pub fn remove(&self, cache_key: &str) -> Result<(), CacheError> {
        let metadata_path = self.metadata_path(cache_key)?;
        if metadata_path.exists() {
            fs::remove_file(&metadata_path)?;
        }
        debug!(key = %cache_key, "Removed layer from cache");
        Ok(())
    }

    /// Clears all cache entries.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let entries = self.list_entries()?;
        for entry in &entries {
            self.remove(&entry.cache_key)?;
        }
        info!(removed = entries.len(), "Cleared all cached layers");
        Ok(entries.len())
    }

    /// Returns the total size of indexed layers in bytes.
    pub fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.list_entries()?.iter().map(|m| m.size_bytes).sum())
    }

    /// Returns the number of cache entries.
    pub fn layer_count(&self) -> Result<usize, CacheError> {
        Ok(self.list_entries()?.len())
    }

    /// Layer digests the index still points at.
    pub fn referenced_layers(&self) -> Result<HashSet<String>, CacheError> {
        Ok(self.list_entries()?.into_iter().filter_map(|m| m.layer_digest).collect())
    }

    /// All entries, least recently used first.
    pub fn list_entries(&self) -> Result<Vec<LayerMetadata>, CacheError> {
        let mut layers = Vec::new();

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            if let Some(cache_key) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(metadata) = self.load_metadata(cache_key) {
                    layers.push(metadata);
                }
            }
        }

        layers.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed).then_with(|| a.cache_key.cmp(&b.cache_key)));
        Ok(layers)
    }

    /// Drops least recently used entries until the index fits the size limit.
    ///
    /// Returns the number of entries evicted.
    pub fn evict_if_needed(&self) -> Result<usize, CacheError> {
        let total_size = self.total_size()?;
        if total_size <= self.size_limit {
            return Ok(0);
        }

        warn!(total_size, limit = self.size_limit, "Cache size exceeds limit, evicting old layers");

        let mut current_size = total_size;
        let mut evicted = 0;
        for layer in self.list_entries()? {
            if current_size <= self.size_limit {
                break;
            }
            info!(key = %layer.cache_key, size = layer.size_bytes, "Evicting layer");
            self.remove(&layer.cache_key)?;
            current_size = current_size.saturating_sub(layer.size_bytes);
            evicted += 1;
        }

        Ok(evicted)
    }

    fn metadata_path(&self, cache_key: &str) -> Result<PathBuf, CacheError> {
        if cache_key.is_empty() || !cache_key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidKey(cache_key.to_string()));
        }
        Ok(self.cache_dir.join(format!("{}.json", cache_key)))
    }

    fn load_metadata(&self, cache_key: &str) -> Result<LayerMetadata, CacheError> {
        let contents = fs::read_to_string(self.metadata_path(cache_key)?)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Written via rename so readers never see a half-written entry.
    fn save_metadata(&self, metadata: &LayerMetadata) -> Result<(), CacheError> {
        let path = self.metadata_path(&metadata.cache_key)?;
        let staged = NamedTempFile::new_in(&self.cache_dir)?;
        serde_json::to_writer_pretty(staged.as_file(), metadata)?;
        staged.persist(&path).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
