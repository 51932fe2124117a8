//! Base runtime sources.
//!
//! A base resolves to an ordered list of layers in the CAS plus the
//! environment its image config declares. Resolution either fully succeeds or
//! fails with [`BuildError::BaseUnreachable`]; nothing is built on a base that
//! could not be resolved.

use crate::builder::cas::CasStore;
use crate::builder::context::BuildContext;
use crate::builder::executor::{BuildError, BuildResult};
use crate::builder::layer::copy_layer;
use crate::builder::oci::RegistryBaseSource;
use crate::config::{BaseSourceMode, Config};
use crate::image::BaseIdentity;
use crate::paths::StorePaths;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One base layer in the CAS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseLayer {
    pub digest: String,
    pub size: u64,
}

/// A base runtime ready to build on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBase {
    pub identity: BaseIdentity,
    /// Layers in application order
    pub layers: Vec<BaseLayer>,
    /// `KEY=VALUE` pairs from the base image config
    pub env: Vec<(String, String)>,
    /// Working directory declared by the base, if any
    #[serde(default)]
    pub workdir: Option<String>,
}

impl ResolvedBase {
    /// Digest identifying the full layer list.
    pub fn layers_digest(layers: &[BaseLayer]) -> String {
        if let [only] = layers {
            return only.digest.clone();
        }
        let mut hasher = Sha256::new();
        for layer in layers {
            hasher.update(layer.digest.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Something that can turn a FROM reference into layers.
#[async_trait]
pub trait BaseSource: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn resolve(&mut self, reference: &str, architecture: &str, cas: &CasStore) -> BuildResult<ResolvedBase>;
}

/// Parse `KEY=VALUE` strings as found in image configs.
pub fn parse_env_list(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct LocalBaseConfig {
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    workdir: Option<String>,
}

/// Bases imported on disk under `<bases>/<name>/<tag>/`.
///
/// The directory holds `rootfs.tar`, `rootfs.tar.gz` or an unpacked
/// `rootfs/` tree, and optionally `config.json` with `env` and `workdir`.
#[derive(Debug, Clone)]
pub struct LocalBaseSource {
    bases_dir: PathBuf,
}

impl LocalBaseSource {
    pub fn new(bases_dir: impl Into<PathBuf>) -> Self {
        Self { bases_dir: bases_dir.into() }
    }

    fn base_dir(&self, reference: &str) -> PathBuf {
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match reference[last_slash..].rfind(':') {
            Some(i) => (&reference[..last_slash + i], &reference[last_slash + i + 1..]),
            None => (reference, "latest"),
        };
        self.bases_dir.join(name).join(tag)
    }

    fn import(&self, dir: &Path, cas: &CasStore) -> BuildResult<BaseLayer> {
        let tar = dir.join("rootfs.tar");
        let tar_gz = dir.join("rootfs.tar.gz");
        let tree = dir.join("rootfs");

        let (digest, size) = if tar.is_file() {
            cas.store_file(&tar)?
        } else if tar_gz.is_file() {
            cas.store_reader(GzDecoder::new(File::open(&tar_gz)?))?
        } else if tree.is_dir() {
            let context = BuildContext::new(tree.clone());
            let layer = copy_layer(&context, &[".".to_string()], "/", "/")?;
            let mut blob = cas.blob_writer()?;
            layer.write_to(&mut blob)?;
            blob.finish()?
        } else {
            return Err(BuildError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} has no rootfs.tar, rootfs.tar.gz or rootfs/", dir.display()),
            )));
        };

        Ok(BaseLayer { digest, size })
    }
}

#[async_trait]
impl BaseSource for LocalBaseSource {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn resolve(&mut self, reference: &str, architecture: &str, cas: &CasStore) -> BuildResult<ResolvedBase> {
        let dir = self.base_dir(reference);
        let unreachable = |reason: String| BuildError::BaseUnreachable { image: reference.to_string(), reason };

        if !dir.is_dir() {
            return Err(unreachable(format!("no local base at {}", dir.display())));
        }

        let layer = self.import(&dir, cas).map_err(|e| unreachable(e.to_string()))?;

        let config_path = dir.join("config.json");
        let config: LocalBaseConfig = if config_path.is_file() {
            let data = fs::read(&config_path).map_err(|e| unreachable(e.to_string()))?;
            serde_json::from_slice(&data)
                .map_err(|e| unreachable(format!("invalid {}: {}", config_path.display(), e)))?
        } else {
            LocalBaseConfig::default()
        };

        info!(base = %reference, digest = %layer.digest, "Resolved local base");

        let layers = vec![layer];
        Ok(ResolvedBase {
            identity: BaseIdentity {
                reference: reference.to_string(),
                architecture: architecture.to_string(),
                digest: ResolvedBase::layers_digest(&layers),
            },
            layers,
            env: parse_env_list(&config.env),
            workdir: config.workdir,
        })
    }
}

/// Tries each source in order; the first success wins.
pub struct ChainedBaseSource {
    sources: Vec<Box<dyn BaseSource>>,
}

impl ChainedBaseSource {
    pub fn new(sources: Vec<Box<dyn BaseSource>>) -> Self {
        Self { sources }
    }

    /// Sources for the configured mode.
    pub fn from_config(config: &Config, paths: &StorePaths) -> Self {
        let local = || Box::new(LocalBaseSource::new(paths.bases_dir())) as Box<dyn BaseSource>;
        let registry = || {
            Box::new(RegistryBaseSource::new(config.insecure_registries.clone(), paths.base_index_dir()))
                as Box<dyn BaseSource>
        };

        let sources = match config.base_source {
            BaseSourceMode::Local => vec![local()],
            BaseSourceMode::Registry => vec![registry()],
            BaseSourceMode::Auto => vec![local(), registry()],
        };
        Self::new(sources)
    }
}

#[async_trait]
impl BaseSource for ChainedBaseSource {
    fn name(&self) -> &'static str {
        "chained"
    }

    async fn resolve(&mut self, reference: &str, architecture: &str, cas: &CasStore) -> BuildResult<ResolvedBase> {
        let mut reasons = Vec::new();

        for source in self.sources.iter_mut() {
            match source.resolve(reference, architecture, cas).await {
                Ok(base) => return Ok(base),
                Err(e) => {
                    debug!(source = source.name(), error = %e, "Base source failed");
                    reasons.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        warn!(base = %reference, "No source could resolve base runtime");
        Err(BuildError::BaseUnreachable {
            image: reference.to_string(),
            reason: if reasons.is_empty() { "no base sources configured".to_string() } else { reasons.join("; ") },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local_base(root: &Path) {
        let dir = root.join("python").join("3.11-slim");
        fs::create_dir_all(dir.join("rootfs/usr/bin")).unwrap();
        fs::write(dir.join("rootfs/usr/bin/python3"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("config.json"), r#"{"env": ["PATH=/usr/local/bin:/usr/bin", "LANG=C.UTF-8"]}"#).unwrap();
    }

    #[tokio::test]
    async fn test_local_base_from_tree() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(&temp.path().join("store")).unwrap();
        local_base(&temp.path().join("bases"));

        let mut source = LocalBaseSource::new(temp.path().join("bases"));
        let base = source.resolve("python:3.11-slim", "amd64", &cas).await.unwrap();

        assert_eq!(base.layers.len(), 1);
        assert!(cas.blob_exists(&base.layers[0].digest));
        assert_eq!(base.identity.digest, base.layers[0].digest);
        assert_eq!(base.env[1], ("LANG".to_string(), "C.UTF-8".to_string()));

        // Re-import is stable
        let again = source.resolve("python:3.11-slim", "amd64", &cas).await.unwrap();
        assert_eq!(again, base);
    }

    #[tokio::test]
    async fn test_missing_base_is_unreachable() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();
        let mut source = ChainedBaseSource::new(vec![Box::new(LocalBaseSource::new(temp.path().join("bases")))]);

        let err = source.resolve("python:3.99", "amd64", &cas).await.unwrap_err();
        assert!(matches!(err, BuildError::BaseUnreachable { .. }));
        assert_eq!(cas.blob_count().unwrap(), 0);
    }

    #[test]
    fn test_parse_env_list() {
        let env = parse_env_list(&["A=1".into(), "B=x=y".into(), "broken".into()]);
        assert_eq!(env, vec![("A".into(), "1".into()), ("B".into(), "x=y".into())]);
    }
}
