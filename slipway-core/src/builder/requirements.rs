//! Dependency manifest (`requirements.txt`) parsing.
//!
//! The builder never resolves packages itself; the installer inside the image
//! does. Parsing here only feeds the build report a package count, so a line
//! the parser does not understand is reported, never fatal.

use sha2::{Digest, Sha256};
use std::fmt;

/// One `name[extras] constraint ; marker` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    /// Version constraint, e.g. `>=2.0` or `==1.32.0`. Empty when unpinned.
    pub constraint: String,
    /// Environment marker after `;`, if any.
    pub marker: Option<String>,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        write!(f, "{}", self.constraint)?;
        if let Some(marker) = &self.marker {
            write!(f, "; {}", marker)?;
        }
        Ok(())
    }
}

/// Ordered list of requirements plus installer option lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyManifest {
    pub requirements: Vec<Requirement>,
    /// Local paths, archive URLs and VCS URLs, kept verbatim.
    pub references: Vec<String>,
    /// Lines such as `-r base.txt` or `--index-url ...`, kept verbatim.
    pub options: Vec<String>,
}

/// Error parsing a dependency manifest.
#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ManifestError {
    pub line: usize,
    pub message: String,
}

impl DependencyManifest {
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let mut manifest = DependencyManifest::default();

        for (idx, raw) in content.lines().enumerate() {
            let line_num = idx + 1;
            let line = strip_comment(raw).trim();

            if line.is_empty() {
                continue;
            }

            if line.starts_with('-') {
                manifest.options.push(line.to_string());
                continue;
            }

            if is_direct_reference(line) {
                manifest.references.push(line.to_string());
                continue;
            }

            manifest.requirements.push(parse_requirement(line, line_num)?);
        }

        Ok(manifest)
    }

    /// sha256 of the raw manifest bytes.
    pub fn digest(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    /// Packages named or referenced by the manifest.
    pub fn len(&self) -> usize {
        self.requirements.len() + self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requirements without any version constraint.
    pub fn unpinned(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| r.constraint.is_empty())
    }
}

/// `#` starts a comment only at line start or after whitespace.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

const VCS_SCHEMES: &[&str] = &["git+", "hg+", "svn+", "bzr+"];
const ARCHIVE_SUFFIXES: &[&str] = &[".whl", ".zip", ".tar.gz", ".tgz", ".tar.bz2", ".tar"];

/// A requirement given by location rather than by name: `./vendor/x.whl`,
/// `.`, `https://host/pkg.zip`, `git+https://host/repo#egg=pkg`.
fn is_direct_reference(line: &str) -> bool {
    let target = line.split(';').next().unwrap_or(line).trim();
    let first = target.split_whitespace().next().unwrap_or(target);

    first.starts_with('.')
        || first.starts_with('/')
        || first.starts_with('~')
        || first.contains("://")
        || first.starts_with("file:")
        || VCS_SCHEMES.iter().any(|scheme| first.starts_with(scheme))
        || ARCHIVE_SUFFIXES.iter().any(|suffix| first.ends_with(suffix))
}

fn parse_requirement(line: &str, line_num: usize) -> Result<Requirement, ManifestError> {
    let (spec, marker) = match line.split_once(';') {
        Some((spec, marker)) => (spec.trim(), Some(marker.trim().to_string())),
        None => (line, None),
    };

    let name_end = spec
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(spec.len());
    let name = &spec[..name_end];

    let valid_edges = |c: Option<char>| c.map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);
    if name.is_empty() || !valid_edges(name.chars().next()) || !valid_edges(name.chars().last()) {
        return Err(ManifestError { line: line_num, message: format!("invalid requirement: {}", line) });
    }

    let mut rest = spec[name_end..].trim_start();
    let mut extras = Vec::new();

    if let Some(after) = rest.strip_prefix('[') {
        let close = after.find(']').ok_or_else(|| ManifestError {
            line: line_num,
            message: format!("unterminated extras in: {}", line),
        })?;
        extras = after[..close]
            .split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        rest = after[close + 1..].trim_start();
    }

    let constraint: String = rest.split_whitespace().collect();
    if !constraint.is_empty() && !constraint.starts_with(|c: char| "=<>!~@".contains(c)) {
        return Err(ManifestError {
            line: line_num,
            message: format!("invalid version constraint '{}' for {}", constraint, name),
        });
    }

    Ok(Requirement { name: name.to_string(), extras, constraint, marker })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dashboard_manifest() {
        let manifest = DependencyManifest::parse(
            "# dashboard deps\nstreamlit==1.32.0\npandas>=2.0,<3\nplotly\n\nrequests[socks] >= 2.0 ; python_version > \"3.8\"\n",
        )
        .unwrap();

        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.requirements[0].name, "streamlit");
        assert_eq!(manifest.requirements[0].constraint, "==1.32.0");
        assert_eq!(manifest.requirements[1].constraint, ">=2.0,<3");
        assert_eq!(manifest.unpinned().count(), 1);

        let requests = &manifest.requirements[3];
        assert_eq!(requests.extras, vec!["socks".to_string()]);
        assert_eq!(requests.constraint, ">=2.0");
        assert_eq!(requests.marker.as_deref(), Some("python_version > \"3.8\""));
        assert_eq!(requests.to_string(), "requests[socks]>=2.0; python_version > \"3.8\"");
    }

    #[test]
    fn test_options_kept_verbatim() {
        let manifest = DependencyManifest::parse("--index-url https://pypi.org/simple\n-r base.txt\nrequests>=2.0 # http\n").unwrap();
        assert_eq!(manifest.options.len(), 2);
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.requirements[0].constraint, ">=2.0");
    }

    #[test]
    fn test_invalid_lines_report_line_number() {
        let err = DependencyManifest::parse("requests>=2.0\n!!!\n").unwrap_err();
        assert_eq!(err.line, 2);

        let err = DependencyManifest::parse("pandas 2.0\n").unwrap_err();
        assert!(err.message.contains("constraint"));
    }

    #[test]
    fn test_direct_references_are_accepted() {
        let manifest = DependencyManifest::parse(
            "streamlit==1.32.0\n./vendor/mypkg-1.0-py3-none-any.whl\n.\nhttps://github.com/org/pkg/archive/main.zip\ngit+https://github.com/org/tool.git@v2#egg=tool\nvendor/extra-0.1.tar.gz ; python_version >= \"3.9\"\nlocalpkg @ file:///opt/localpkg\n",
        )
        .unwrap();

        assert_eq!(manifest.requirements.len(), 2);
        assert_eq!(manifest.requirements[1].name, "localpkg");
        assert_eq!(manifest.references.len(), 5);
        assert_eq!(manifest.references[3], "git+https://github.com/org/tool.git@v2#egg=tool");
        assert_eq!(manifest.len(), 7);
    }

    #[test]
    fn test_digest_tracks_bytes() {
        let a = DependencyManifest::digest(b"requests>=2.0\n");
        let b = DependencyManifest::digest(b"requests>=2.1\n");
        assert_ne!(a, b);
        assert_eq!(a, DependencyManifest::digest(b"requests>=2.0\n"));
        assert_eq!(a.len(), 64);
    }
}
