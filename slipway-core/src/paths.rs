//! Centralized path configuration for Slipway.
//!
//! All store paths go through this module so the builder, the launcher and
//! the CLI agree on the on-disk layout:
//!
//! ```text
//! <data_dir>/
//! ├── config.json
//! ├── blobs/sha256/   # content-addressed layers
//! ├── cache/          # cache key -> layer metadata
//! ├── images/         # image records by id
//! ├── refs/           # name/tag -> image id
//! ├── bases/          # local base runtimes + registry pull index
//! └── containers/     # per-run root filesystems
//! ```

use std::path::{Path, PathBuf};

/// Get the Slipway data directory.
///
/// Resolution order:
/// 1. `SLIPWAY_DATA_DIR` environment variable
/// 2. `~/.slipway`
/// 3. `/var/lib/slipway` when no home directory can be determined
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SLIPWAY_DATA_DIR") {
        return PathBuf::from(dir);
    }

    dirs::home_dir().map(|h| h.join(".slipway")).unwrap_or_else(|| PathBuf::from("/var/lib/slipway"))
}

/// Resolved store layout rooted at a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at [`data_dir`].
    pub fn from_env() -> Self {
        Self::new(data_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn cas_dir(&self) -> PathBuf {
        self.root.clone()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    pub fn bases_dir(&self) -> PathBuf {
        self.root.join("bases")
    }

    pub fn base_index_dir(&self) -> PathBuf {
        self.bases_dir().join("index")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Scratch directory for one build.
    pub fn build_dir(&self, build_id: &str) -> PathBuf {
        self.root.join("tmp").join(format!("build-{}", build_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_from_env() {
        std::env::set_var("SLIPWAY_DATA_DIR", "/tmp/slipway-test");
        assert_eq!(data_dir(), PathBuf::from("/tmp/slipway-test"));
        std::env::remove_var("SLIPWAY_DATA_DIR");
    }

    #[test]
    fn test_paths_consistency() {
        let paths = StorePaths::new("/srv/slipway");
        let base = paths.root().to_path_buf();
        assert!(paths.config_path().starts_with(&base));
        assert!(paths.cache_dir().starts_with(&base));
        assert!(paths.images_dir().starts_with(&base));
        assert!(paths.refs_dir().starts_with(&base));
        assert!(paths.base_index_dir().starts_with(paths.bases_dir()));
        assert!(paths.containers_dir().starts_with(&base));
        assert!(paths.build_dir("abc").ends_with("tmp/build-abc"));
    }
}
