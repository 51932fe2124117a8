//! Build context: the directory tree COPY instructions read from.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Build context containing source files and configuration.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Canonical path of the context directory
    pub root: PathBuf,
    /// Recipe path relative to the context (may not exist)
    pub recipe_path: PathBuf,
    /// Build arguments (ARG values)
    pub build_args: HashMap<String, String>,
    /// Skip cache lookups (results are still cached)
    pub no_cache: bool,
}

/// Error resolving or reading context sources.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("source {0:?} not found in build context")]
    NotFound(PathBuf),

    #[error("source {0} escapes the build context")]
    Escapes(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file system entry reachable from a COPY source, in sorted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Path relative to the copied source root ("" for the root itself)
    pub rel_path: PathBuf,
    pub abs_path: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File { size: u64 },
    Symlink { target: PathBuf },
}

impl BuildContext {
    pub fn new(root: PathBuf) -> Self {
        Self { root, recipe_path: PathBuf::from("Dockerfile"), build_args: HashMap::new(), no_cache: false }
    }

    /// Resolve a COPY source to an absolute path inside the context.
    pub fn resolve_source(&self, source: &str) -> Result<PathBuf, ContextError> {
        let rel = Path::new(source.trim_start_matches('/'));
        let mut resolved = self.root.clone();

        for component in rel.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(ContextError::Escapes(source.to_string()))
                }
            }
        }

        if fs::symlink_metadata(&resolved).is_err() {
            return Err(ContextError::NotFound(resolved));
        }

        Ok(resolved)
    }

    /// sha256 over paths, permission bits, symlink targets and file contents
    /// of every source. Modification times do not participate.
    pub fn digest_sources(&self, sources: &[String]) -> Result<String, ContextError> {
        let mut hasher = Sha256::new();

        for source in sources {
            let root = self.resolve_source(source)?;
            hasher.update(b"source\0");
            hasher.update(source.as_bytes());
            hasher.update(b"\0");

            for entry in walk(&root)? {
                hasher.update(entry.rel_path.to_string_lossy().as_bytes());
                hasher.update(b"\0");
                hasher.update(entry.mode.to_le_bytes());
                match &entry.kind {
                    EntryKind::Dir => hasher.update(b"d"),
                    EntryKind::Symlink { target } => {
                        hasher.update(b"l");
                        hasher.update(target.to_string_lossy().as_bytes());
                    }
                    EntryKind::File { size } => {
                        hasher.update(b"f");
                        hasher.update(size.to_le_bytes());
                        let data = fs::read(&entry.abs_path)
                            .map_err(|e| ContextError::Io { path: entry.abs_path.clone(), source: e })?;
                        hasher.update(&data);
                    }
                }
                hasher.update(b"\0");
            }
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Walk a file or directory tree in deterministic (sorted) order. Symlinks
/// are reported, not followed.
pub fn walk(root: &Path) -> Result<Vec<ContextEntry>, ContextError> {
    let mut entries = Vec::new();
    walk_into(root, PathBuf::new(), &mut entries)?;
    Ok(entries)
}

fn walk_into(abs: &Path, rel: PathBuf, out: &mut Vec<ContextEntry>) -> Result<(), ContextError> {
    let io_err = |e: io::Error| ContextError::Io { path: abs.to_path_buf(), source: e };
    let meta = fs::symlink_metadata(abs).map_err(io_err)?;
    let mode = file_mode(&meta);

    if meta.file_type().is_symlink() {
        let target = fs::read_link(abs).map_err(io_err)?;
        out.push(ContextEntry { rel_path: rel, abs_path: abs.to_path_buf(), kind: EntryKind::Symlink { target }, mode });
    } else if meta.is_dir() {
        out.push(ContextEntry { rel_path: rel.clone(), abs_path: abs.to_path_buf(), kind: EntryKind::Dir, mode });

        let mut children: Vec<_> = fs::read_dir(abs)
            .map_err(io_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        children.sort_by_key(|c| c.file_name());

        for child in children {
            walk_into(&child.path(), rel.join(child.file_name()), out)?;
        }
    } else if meta.is_file() {
        out.push(ContextEntry {
            rel_path: rel,
            abs_path: abs.to_path_buf(),
            kind: EntryKind::File { size: meta.len() },
            mode,
        });
    }
    // Sockets, fifos and devices are never copied

    Ok(())
}

#[cfg(unix)]
pub(crate) fn file_mode(meta: &fs::Metadata) -> u32 {
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context_with(files: &[(&str, &str)]) -> (TempDir, BuildContext) {
        let temp = TempDir::new().unwrap();
        for (path, content) in files {
            let full = temp.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        let context = BuildContext::new(temp.path().to_path_buf());
        (temp, context)
    }

    #[test]
    fn test_resolve_source() {
        let (_temp, context) = context_with(&[("requirements.txt", "requests>=2.0\n")]);
        assert!(context.resolve_source("requirements.txt").is_ok());
        assert!(context.resolve_source("./requirements.txt").is_ok());
        assert!(matches!(context.resolve_source("missing.txt"), Err(ContextError::NotFound(_))));
        assert!(matches!(context.resolve_source("../etc/passwd"), Err(ContextError::Escapes(_))));
    }

    #[test]
    fn test_digest_ignores_mtime_but_tracks_content() {
        let (temp, context) = context_with(&[("app.py", "print('ok')\n"), ("requirements.txt", "requests>=2.0\n")]);
        let sources = vec![".".to_string()];
        let first = context.digest_sources(&sources).unwrap();

        // Rewrite identical bytes: new mtime, same digest
        fs::write(temp.path().join("app.py"), "print('ok')\n").unwrap();
        assert_eq!(context.digest_sources(&sources).unwrap(), first);

        fs::write(temp.path().join("app.py"), "print('changed')\n").unwrap();
        assert_ne!(context.digest_sources(&sources).unwrap(), first);
    }

    #[test]
    fn test_manifest_digest_independent_of_app() {
        let (temp, context) = context_with(&[("app.py", "print('ok')\n"), ("requirements.txt", "requests>=2.0\n")]);
        let manifest = vec!["requirements.txt".to_string()];
        let before = context.digest_sources(&manifest).unwrap();

        fs::write(temp.path().join("app.py"), "print('edited')\n").unwrap();
        assert_eq!(context.digest_sources(&manifest).unwrap(), before);
    }

    #[test]
    fn test_walk_is_sorted() {
        let (temp, _context) = context_with(&[("b.txt", "b"), ("a/z.txt", "z"), ("a/y.txt", "y")]);
        let entries = walk(temp.path()).unwrap();
        let paths: Vec<String> = entries.iter().map(|e| e.rel_path.to_string_lossy().to_string()).collect();
        assert_eq!(paths, vec!["", "a", "a/y.txt", "a/z.txt", "b.txt"]);
    }
}
