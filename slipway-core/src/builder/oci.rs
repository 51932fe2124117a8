//! OCI registry client for pulling base runtimes from Docker Hub and other
//! registries.
//!
//! Layers are decompressed into the CAS as plain tarballs so they apply the
//! same way as layers the builder produces. A resolved base is indexed by the
//! registry's manifest digest; pulling an unchanged tag again costs a single
//! manifest request.
//!
//! Based on the OCI Distribution Spec: https://github.com/opencontainers/distribution-spec

use crate::builder::base::{parse_env_list, BaseLayer, BaseSource, ResolvedBase};
use crate::builder::cas::CasStore;
use crate::builder::executor::{BuildError, BuildResult};
use crate::image::BaseIdentity;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::{
    ImageIndexEntry, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Platform resolver that selects `linux/<host arch>` from a multi-arch index.
///
/// Images always run Linux userlands, even when the host is not Linux.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = crate::image::host_architecture();
    debug!("Looking for linux/{} image variant", arch);

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|platform| platform.os == "linux" && platform.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

/// Subset of the OCI image config the builder reads.
#[derive(Debug, Default, Deserialize)]
struct OciImageConfig {
    #[serde(default)]
    config: OciRuntimeConfig,
}

#[derive(Debug, Default, Deserialize)]
struct OciRuntimeConfig {
    #[serde(rename = "Env", default)]
    env: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    working_dir: Option<String>,
}

/// Pulls bases from OCI registries.
pub struct RegistryBaseSource {
    client: Client,
    index_dir: PathBuf,
}

impl RegistryBaseSource {
    /// `insecure` registries are contacted over plain HTTP.
    pub fn new(insecure: Vec<String>, index_dir: PathBuf) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(insecure),
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };

        Self { client: Client::new(config), index_dir }
    }

    /// Parse an image reference string into an OCI Reference.
    ///
    /// Handles:
    /// - Short names: "python" → "docker.io/library/python:latest"
    /// - Tagged names: "python:3.11-slim" → "docker.io/library/python:3.11-slim"
    /// - Fully qualified: "ghcr.io/org/repo:tag"
    pub fn parse_reference(image: &str) -> BuildResult<Reference> {
        let first = image.split('/').next().unwrap_or_default();
        let has_registry = image.contains('/') && (first.contains('.') || first.contains(':') || first == "localhost");

        let normalized = if !image.contains('/') {
            format!("docker.io/library/{}", image)
        } else if !has_registry {
            format!("docker.io/{}", image)
        } else {
            image.to_string()
        };

        // Add :latest if no tag specified
        let last = normalized.rsplit('/').next().unwrap_or_default();
        let normalized = if !last.contains(':') && !normalized.contains('@') {
            format!("{}:latest", normalized)
        } else {
            normalized
        };

        Reference::try_from(normalized.as_str())
            .map_err(|e| BuildError::BaseUnreachable { image: image.to_string(), reason: e.to_string() })
    }

    fn index_path(&self, manifest_digest: &str, architecture: &str) -> PathBuf {
        let hex = manifest_digest.trim_start_matches("sha256:");
        self.index_dir.join(format!("{}-{}.json", hex, architecture))
    }

    /// A previously pulled base for this manifest, if all its blobs survive.
    fn load_indexed(&self, manifest_digest: &str, architecture: &str, cas: &CasStore) -> Option<ResolvedBase> {
        let data = fs::read(self.index_path(manifest_digest, architecture)).ok()?;
        let base: ResolvedBase = serde_json::from_slice(&data).ok()?;
        if base.layers.iter().all(|l| cas.blob_exists(&l.digest)) {
            Some(base)
        } else {
            warn!(digest = %manifest_digest, "Indexed base is missing layers, pulling again");
            None
        }
    }

    fn save_index(&self, manifest_digest: &str, base: &ResolvedBase) -> BuildResult<()> {
        fs::create_dir_all(&self.index_dir)?;
        let json = serde_json::to_vec_pretty(base).map_err(|e| BuildError::Io(e.into()))?;
        fs::write(self.index_path(manifest_digest, &base.identity.architecture), json)?;
        Ok(())
    }
}

#[async_trait]
impl BaseSource for RegistryBaseSource {
    fn name(&self) -> &'static str {
        "registry"
    }

    #[instrument(skip(self, cas), fields(image = %reference))]
    async fn resolve(&mut self, reference: &str, architecture: &str, cas: &CasStore) -> BuildResult<ResolvedBase> {
        let unreachable = |reason: String| BuildError::BaseUnreachable { image: reference.to_string(), reason };
        let parsed = Self::parse_reference(reference)?;
        let auth = RegistryAuth::Anonymous;

        let manifest_digest = self
            .client
            .fetch_manifest_digest(&parsed, &auth)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        if let Some(base) = self.load_indexed(&manifest_digest, architecture, cas) {
            info!(digest = %manifest_digest, "Base already pulled");
            return Ok(base);
        }

        info!("Pulling base from registry");
        let image_data = self
            .client
            .pull(
                &parsed,
                &auth,
                vec![IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE],
            )
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        info!(layers = image_data.layers.len(), "Image manifest fetched successfully");

        let mut layers = Vec::with_capacity(image_data.layers.len());
        for (i, layer) in image_data.layers.iter().enumerate() {
            let (digest, size) = if layer.media_type.contains("gzip") {
                cas.store_reader(GzDecoder::new(layer.data.as_slice()))
            } else {
                cas.store_reader(layer.data.as_slice())
            }
            .map_err(|e| unreachable(format!("layer {}: {}", i + 1, e)))?;

            debug!(layer = i + 1, total = image_data.layers.len(), digest = %digest, size, "Stored base layer");
            layers.push(BaseLayer { digest, size });
        }

        let config: OciImageConfig = serde_json::from_slice(&image_data.config.data).unwrap_or_default();

        let base = ResolvedBase {
            identity: BaseIdentity {
                reference: reference.to_string(),
                architecture: architecture.to_string(),
                digest: manifest_digest.trim_start_matches("sha256:").to_string(),
            },
            layers,
            env: parse_env_list(&config.config.env.unwrap_or_default()),
            workdir: config.config.working_dir.filter(|w| !w.is_empty()),
        };

        if let Err(e) = self.save_index(&manifest_digest, &base) {
            warn!(error = %e, "Failed to index pulled base");
        }

        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_short_name() {
        let reference = RegistryBaseSource::parse_reference("python").unwrap();
        assert_eq!(reference.registry(), "docker.io");
        assert_eq!(reference.repository(), "library/python");
        assert_eq!(reference.tag(), Some("latest"));
    }

    #[test]
    fn test_parse_reference_with_tag() {
        let reference = RegistryBaseSource::parse_reference("python:3.11-slim").unwrap();
        assert_eq!(reference.registry(), "docker.io");
        assert_eq!(reference.repository(), "library/python");
        assert_eq!(reference.tag(), Some("3.11-slim"));
    }

    #[test]
    fn test_parse_reference_fully_qualified() {
        let reference = RegistryBaseSource::parse_reference("ghcr.io/org/runtime:v1.0.0").unwrap();
        assert_eq!(reference.registry(), "ghcr.io");
        assert_eq!(reference.repository(), "org/runtime");
        assert_eq!(reference.tag(), Some("v1.0.0"));
    }

    #[test]
    fn test_parse_reference_local_registry() {
        let reference = RegistryBaseSource::parse_reference("localhost:5000/python").unwrap();
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "python");
        assert_eq!(reference.tag(), Some("latest"));
    }

    #[test]
    fn test_parse_reference_with_org() {
        let reference = RegistryBaseSource::parse_reference("myorg/runtime:latest").unwrap();
        assert_eq!(reference.registry(), "docker.io");
        assert_eq!(reference.repository(), "myorg/runtime");
    }
}
