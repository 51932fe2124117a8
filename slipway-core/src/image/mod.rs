//! Image domain types.
//!
//! An image is an ordered list of layers on top of a base runtime plus the
//! configuration the launcher needs. Records are immutable once committed.

pub mod store;

pub use store::ImageStore;

use crate::error::{Result, SlipwayError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Tag applied when a reference has none.
pub const DEFAULT_TAG: &str = "latest";

/// `name[:tag]` naming a local image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| SlipwayError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        // A colon after the last slash separates the tag (registry ports
        // like localhost:5000/app stay in the name)
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match reference[last_slash..].rfind(':') {
            Some(i) => (&reference[..last_slash + i], &reference[last_slash + i + 1..]),
            None => (reference, DEFAULT_TAG),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        let mut chars = name.chars();
        if !chars.next().map(|c| c.is_ascii_lowercase() || c.is_ascii_digit()).unwrap_or(false) {
            return Err(invalid("name must start with a lowercase letter or digit"));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._/-:".contains(c)) {
            return Err(invalid("name may only contain lowercase letters, digits, '.', '_', '/', '-'"));
        }
        if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(invalid("name has an empty or relative path component"));
        }

        if tag.is_empty() || tag.len() > 128 {
            return Err(invalid("tag must be 1 to 128 characters"));
        }
        let mut chars = tag.chars();
        if !chars.next().map(|c| c.is_ascii_alphanumeric() || c == '_').unwrap_or(false) {
            return Err(invalid("tag must start with a letter, digit or '_'"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
            return Err(invalid("tag may only contain letters, digits, '.', '_', '-'"));
        }

        Ok(Self { name: name.to_string(), tag: tag.to_string() })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Architecture name used for base images (`amd64`, `arm64`).
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Resolved base runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseIdentity {
    /// Reference as written in FROM
    pub reference: String,
    pub architecture: String,
    /// Content digest the reference resolved to
    pub digest: String,
}

/// Runtime configuration carried by an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Working directory, also the launched process's cwd
    pub workdir: String,
    /// Environment in declaration order, later entries win
    pub env: Vec<(String, String)>,
    pub exposed_ports: Vec<u16>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub labels: Vec<(String, String)>,
}

impl ImageConfig {
    /// Set or replace an environment variable, keeping first-seen order.
    pub fn set_env(&mut self, key: &str, value: &str) {
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.env.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        match self.labels.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.labels.push((key.to_string(), value.to_string())),
        }
    }
}

/// One step of image history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub cache_key: String,
    /// CAS digest; `None` for metadata-only steps and no-op RUNs
    pub digest: Option<String>,
    pub size: u64,
    /// Instruction that created this layer
    pub created_by: String,
    /// True if this layer adds no files (e.g., ENV, LABEL)
    pub empty_layer: bool,
}

/// A committed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// sha256 of the canonical record without `created`
    pub id: String,
    pub reference: ImageReference,
    pub base: BaseIdentity,
    pub architecture: String,
    pub os: String,
    pub layers: Vec<LayerRecord>,
    pub config: ImageConfig,
    pub created: DateTime<Utc>,
}

#[derive(Serialize)]
struct CanonicalRecord<'a> {
    reference: &'a ImageReference,
    base: &'a BaseIdentity,
    architecture: &'a str,
    os: &'a str,
    layers: &'a [LayerRecord],
    config: &'a ImageConfig,
}

impl ImageRecord {
    /// Build a record and compute its id.
    pub fn new(reference: ImageReference, base: BaseIdentity, layers: Vec<LayerRecord>, config: ImageConfig) -> Self {
        let mut record = Self {
            id: String::new(),
            architecture: base.architecture.clone(),
            os: "linux".to_string(),
            reference,
            base,
            layers,
            config,
            created: Utc::now(),
        };
        record.id = record.compute_id();
        record
    }

    pub fn compute_id(&self) -> String {
        let canonical = CanonicalRecord {
            reference: &self.reference,
            base: &self.base,
            architecture: &self.architecture,
            os: &self.os,
            layers: &self.layers,
            config: &self.config,
        };
        // Serializing plain structs and vectors cannot fail
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        format!("{:x}", Sha256::digest(&json))
    }

    /// Layer digests in application order.
    pub fn layer_digests(&self) -> Vec<String> {
        self.layers.iter().filter_map(|l| l.digest.clone()).collect()
    }

    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    pub fn short_id(&self) -> &str {
        &self.id[..12.min(self.id.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let r = ImageReference::parse("dashboard").unwrap();
        assert_eq!(r.name, "dashboard");
        assert_eq!(r.tag, "latest");

        let r = ImageReference::parse("team/dash-board:v1.2").unwrap();
        assert_eq!(r.name, "team/dash-board");
        assert_eq!(r.tag, "v1.2");
        assert_eq!(r.to_string(), "team/dash-board:v1.2");

        let r = ImageReference::parse("localhost:5000/dash").unwrap();
        assert_eq!(r.name, "localhost:5000/dash");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_parse_reference_rejects() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("Dashboard").is_err());
        assert!(ImageReference::parse("dash:").is_err());
        assert!(ImageReference::parse("dash:-bad").is_err());
        assert!(ImageReference::parse("dash/../etc").is_err());
        assert!(ImageReference::parse(&format!("dash:{}", "a".repeat(129))).is_err());
    }

    #[test]
    fn test_env_order_and_override() {
        let mut config = ImageConfig::default();
        config.set_env("PATH", "/usr/bin");
        config.set_env("PYTHONUNBUFFERED", "1");
        config.set_env("PATH", "/opt/bin:/usr/bin");

        assert_eq!(config.env[0], ("PATH".to_string(), "/opt/bin:/usr/bin".to_string()));
        assert_eq!(config.get_env("PYTHONUNBUFFERED"), Some("1"));
    }

    #[test]
    fn test_id_ignores_created() {
        let base = BaseIdentity { reference: "python:3.11-slim".into(), architecture: "amd64".into(), digest: "ab".repeat(32) };
        let reference = ImageReference::parse("dash").unwrap();
        let mut a = ImageRecord::new(reference.clone(), base.clone(), vec![], ImageConfig::default());
        let b = ImageRecord::new(reference, base, vec![], ImageConfig::default());

        a.created = a.created - chrono::Duration::hours(1);
        assert_eq!(a.compute_id(), b.id);
        assert_eq!(a.id, b.id);
        assert_eq!(a.short_id().len(), 12);
    }
}
