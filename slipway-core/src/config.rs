//! Configuration management.

use crate::error::{Result, SlipwayError};
use crate::paths::StorePaths;
use crate::ports::{ServeEndpoint, DEFAULT_SERVE_PORT};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// How RUN steps and launched processes see the image filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// chroot when running as root on Linux, host otherwise
    Auto,
    Chroot,
    Host,
}

/// Where base runtimes are resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseSourceMode {
    /// Local base store first, then the registry
    Auto,
    Local,
    Registry,
}

/// Persistent configuration for Slipway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub cache_size_limit_bytes: u64,
    pub isolation: IsolationMode,
    pub base_source: BaseSourceMode,
    /// Registries reached over plain HTTP.
    pub insecure_registries: Vec<String>,
    pub default_base: String,
    pub manifest_path: String,
    pub serve_port: u16,
    pub bind_address: IpAddr,
    pub startup_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let endpoint = ServeEndpoint::default();
        Self {
            log_level: "info".to_string(),
            cache_size_limit_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            isolation: IsolationMode::Auto,
            base_source: BaseSourceMode::Auto,
            insecure_registries: vec!["localhost".to_string()],
            default_base: "python:3.11-slim".to_string(),
            manifest_path: "requirements.txt".to_string(),
            serve_port: DEFAULT_SERVE_PORT,
            bind_address: endpoint.address,
            startup_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from the store, falling back to defaults when no
    /// config file exists.
    pub fn load(paths: &StorePaths) -> Result<Self> {
        Self::load_from(&paths.config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| SlipwayError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| SlipwayError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the store.
    pub fn save(&self, paths: &StorePaths) -> Result<()> {
        let path = paths.config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SlipwayError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| SlipwayError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| SlipwayError::IoError { path, source: e })
    }

    pub fn validate(&self) -> Result<()> {
        if self.serve_port == 0 {
            return Err(SlipwayError::InvalidConfig { reason: "serve_port must be non-zero".into() });
        }
        if self.manifest_path.trim().is_empty() {
            return Err(SlipwayError::InvalidConfig { reason: "manifest_path must not be empty".into() });
        }
        if self.default_base.trim().is_empty() {
            return Err(SlipwayError::InvalidConfig { reason: "default_base must not be empty".into() });
        }
        Ok(())
    }

    pub fn endpoint(&self) -> ServeEndpoint {
        ServeEndpoint::new(self.bind_address, self.serve_port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(&StorePaths::new(temp.path())).unwrap();
        assert_eq!(config.serve_port, 8501);
        assert_eq!(config.manifest_path, "requirements.txt");
        assert!(config.endpoint().address.is_unspecified());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let paths = StorePaths::new(temp.path());

        let config = Config { serve_port: 9000, isolation: IsolationMode::Host, ..Config::default() };
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.serve_port, 9000);
        assert_eq!(loaded.isolation, IsolationMode::Host);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"log_level": "debug", "base_source": "local"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.base_source, BaseSourceMode::Local);
        assert_eq!(config.default_base, "python:3.11-slim");
    }

    #[test]
    fn test_invalid_port_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"serve_port": 0}"#).unwrap();
        assert!(matches!(Config::load_from(&path), Err(SlipwayError::InvalidConfig { .. })));
    }
}
