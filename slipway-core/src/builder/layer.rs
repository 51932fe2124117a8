//! Filesystem layers.
//!
//! A layer is an uncompressed tarball. Layers written here are
//! deterministic: entries sorted by path, mtime/uid/gid zeroed, so the same
//! content always hashes to the same digest. Deletions are recorded as
//! `.wh.<name>` whiteouts, the convention registry base layers also use.

use crate::builder::cas::CasStore;
use crate::builder::context::{file_mode, walk, BuildContext, ContextError, EntryKind};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Paths never captured from an install step: package manager caches and
/// scratch space. Relative to the image root.
pub const PACKAGE_CACHE_EXCLUDES: &[&str] = &["root/.cache", "tmp", "var/cache/apt", "var/lib/apt/lists"];

/// Paths the runner provides to RUN steps from the host. Never captured.
pub const RUNTIME_EXCLUDES: &[&str] = &["dev", "etc/hosts", "etc/resolv.conf", "proc"];

#[derive(Debug, Clone)]
enum LayerEntry {
    Dir { mode: u32 },
    File { mode: u32, size: u64, source: PathBuf },
    Symlink { target: PathBuf },
    Whiteout,
}

/// Accumulates layer entries and writes them as a deterministic tarball.
#[derive(Debug, Default)]
pub struct LayerWriter {
    entries: BTreeMap<String, LayerEntry>,
    owner: Option<(u64, u64)>,
}

impl LayerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Numeric owner applied to every entry (COPY --chown).
    pub fn with_owner(mut self, uid: u64, gid: u64) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    /// Apply a `uid[:gid]` owner given as numbers (COPY --chown).
    pub fn with_owner_spec(self, spec: &str) -> Result<Self, String> {
        let (uid, gid) = spec.split_once(':').unwrap_or((spec, spec));
        match (uid.parse::<u64>(), gid.parse::<u64>()) {
            (Ok(uid), Ok(gid)) => Ok(self.with_owner(uid, gid)),
            _ => Err(format!("--chown={} must be numeric uid[:gid]", spec)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Add a directory and any missing parents.
    pub fn add_dir(&mut self, path: &str, mode: u32) {
        let path = clean(path);
        if path.is_empty() {
            return;
        }
        self.add_parents(&path);
        self.entries.insert(path, LayerEntry::Dir { mode });
    }

    /// Add a regular file whose content is read from `source` at write time.
    pub fn add_file(&mut self, path: &str, mode: u32, size: u64, source: PathBuf) {
        let path = clean(path);
        self.add_parents(&path);
        self.entries.insert(path, LayerEntry::File { mode, size, source });
    }

    pub fn add_symlink(&mut self, path: &str, target: PathBuf) {
        let path = clean(path);
        self.add_parents(&path);
        self.entries.insert(path, LayerEntry::Symlink { target });
    }

    /// Record deletion of `path` from lower layers.
    pub fn add_whiteout(&mut self, path: &str) {
        let path = clean(path);
        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (format!("{}/", parent), name),
            None => (String::new(), path.as_str()),
        };
        let whiteout = format!("{}{}{}", parent, WHITEOUT_PREFIX, name);
        self.entries.insert(whiteout, LayerEntry::Whiteout);
    }

    fn add_parents(&mut self, path: &str) {
        let mut prefix = String::new();
        let parts: Vec<&str> = path.split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.entries.entry(prefix.clone()).or_insert(LayerEntry::Dir { mode: 0o755 });
        }
    }

    /// Write the tarball to `out`.
    pub fn write_to<W: Write>(&self, out: W) -> io::Result<W> {
        let mut builder = tar::Builder::new(out);
        let (uid, gid) = self.owner.unwrap_or((0, 0));

        for (path, entry) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_uid(uid);
            header.set_gid(gid);
            header.set_mtime(0);

            match entry {
                LayerEntry::Dir { mode } => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(*mode);
                    header.set_size(0);
                    builder.append_data(&mut header, format!("{}/", path), io::empty())?;
                }
                LayerEntry::File { mode, size, source } => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(*size);
                    let file = File::open(source)?;
                    // A file that changed size since it was recorded would
                    // corrupt the archive; clamp to the recorded size.
                    builder.append_data(&mut header, path, file.take(*size))?;
                }
                LayerEntry::Symlink { target } => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target)?;
                }
                LayerEntry::Whiteout => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(0o644);
                    header.set_size(0);
                    builder.append_data(&mut header, path, io::empty())?;
                }
            }
        }

        builder.into_inner()
    }

    /// Write the tarball into memory.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        self.write_to(Vec::new())
    }
}

/// Strip leading `/` and `./`, collapse `.` components.
fn clean(path: &str) -> String {
    path.split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a possibly relative image path against the working directory.
pub fn image_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        clean(path)
    } else {
        clean(&format!("{}/{}", workdir, path))
    }
}

/// Layer for WORKDIR: the directory and its parents.
pub fn workdir_layer(workdir: &str) -> LayerWriter {
    let mut layer = LayerWriter::new();
    layer.add_dir(workdir, 0o755);
    layer
}

/// Layer for `COPY sources... destination`.
///
/// A directory source copies its contents. The destination is treated as a
/// directory when it ends in `/`, is `.`, or there are several sources.
pub fn copy_layer(
    context: &BuildContext,
    sources: &[String],
    destination: &str,
    workdir: &str,
) -> Result<LayerWriter, ContextError> {
    let dest = image_path(workdir, destination);
    let dest_is_dir = destination.ends_with('/') || clean(destination).is_empty() || sources.len() > 1;
    let mut layer = LayerWriter::new();

    for source in sources {
        let abs = context.resolve_source(source)?;
        let entries = walk(&abs)?;
        let source_is_dir = entries.first().map(|e| e.kind == EntryKind::Dir).unwrap_or(false);

        let base = if source_is_dir || !dest_is_dir {
            dest.clone()
        } else {
            let name = abs.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            join(&dest, &name)
        };

        if source_is_dir {
            layer.add_dir(&base, 0o755);
        }

        for entry in entries {
            let rel = entry.rel_path.to_string_lossy();
            if rel.is_empty() && source_is_dir {
                continue;
            }
            let target = if rel.is_empty() { base.clone() } else { join(&base, &rel) };

            match entry.kind {
                EntryKind::Dir => layer.add_dir(&target, entry.mode),
                EntryKind::File { size } => layer.add_file(&target, entry.mode, size, entry.abs_path),
                EntryKind::Symlink { target: link } => layer.add_symlink(&target, link),
            }
        }
    }

    Ok(layer)
}

fn join(base: &str, rel: &str) -> String {
    if base.is_empty() {
        clean(rel)
    } else {
        clean(&format!("{}/{}", base, rel))
    }
}

/// State of one path in a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct SnapEntry {
    kind: SnapKind,
    mode: u32,
    mtime_ns: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SnapKind {
    Dir,
    File { size: u64 },
    Symlink { target: PathBuf },
}

/// Metadata snapshot of a root filesystem, used to diff a RUN step.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<String, SnapEntry>,
}

impl Snapshot {
    /// Capture every path under `root`, skipping `excludes` and their
    /// descendants.
    pub fn capture(root: &Path, excludes: &[&str]) -> Result<Self, ContextError> {
        let mut entries = BTreeMap::new();

        for entry in walk(root)? {
            let rel = entry.rel_path.to_string_lossy().to_string();
            if rel.is_empty() || is_excluded(&rel, excludes) {
                continue;
            }

            let meta = fs::symlink_metadata(&entry.abs_path)
                .map_err(|e| ContextError::Io { path: entry.abs_path.clone(), source: e })?;
            let mtime_ns = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);

            let kind = match entry.kind {
                EntryKind::Dir => SnapKind::Dir,
                EntryKind::File { size } => SnapKind::File { size },
                EntryKind::Symlink { target } => SnapKind::Symlink { target },
            };

            entries.insert(rel, SnapEntry { kind, mode: file_mode(&meta), mtime_ns });
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_excluded(rel: &str, excludes: &[&str]) -> bool {
    excludes.iter().any(|ex| rel == *ex || rel.starts_with(&format!("{}/", ex)))
}

/// Layer holding the changes from `before` to `after` under `root`.
pub fn diff_layer(root: &Path, before: &Snapshot, after: &Snapshot) -> LayerWriter {
    let mut layer = LayerWriter::new();

    for (path, entry) in &after.entries {
        let changed = match before.entries.get(path) {
            None => true,
            // Directories only carry mode; their mtime moves with every child
            Some(old) if matches!(entry.kind, SnapKind::Dir) => old.kind != entry.kind || old.mode != entry.mode,
            Some(old) => old != entry,
        };
        if !changed {
            continue;
        }

        match &entry.kind {
            SnapKind::Dir => layer.add_dir(path, entry.mode),
            SnapKind::File { size } => layer.add_file(path, entry.mode, *size, root.join(path)),
            SnapKind::Symlink { target } => layer.add_symlink(path, target.clone()),
        }
    }

    let mut deleted_dirs: Vec<&str> = Vec::new();
    for (path, entry) in &before.entries {
        if after.entries.contains_key(path) {
            continue;
        }
        // A deleted directory's whiteout covers its children
        if deleted_dirs.iter().any(|d| path.starts_with(&format!("{}/", d))) {
            continue;
        }
        if matches!(entry.kind, SnapKind::Dir) {
            deleted_dirs.push(path);
        }
        layer.add_whiteout(path);
    }

    layer
}

/// Unpack a layer onto `rootfs`, honouring whiteouts.
pub fn apply_layer<R: Read>(reader: R, rootfs: &Path) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let rel = match sanitize(&path) {
            Some(rel) => rel,
            None => {
                warn!(path = %path.display(), "Skipping layer entry outside the root filesystem");
                continue;
            }
        };

        let name = rel.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();

        if name == OPAQUE_WHITEOUT {
            let dir = rootfs.join(&parent);
            if dir.is_dir() {
                for child in fs::read_dir(&dir)? {
                    remove_path(&child?.path())?;
                }
            }
            continue;
        }

        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&rootfs.join(&parent).join(hidden))?;
            continue;
        }

        let dest = rootfs.join(&rel);
        let is_dir = entry.header().entry_type().is_dir();
        if let Ok(existing) = fs::symlink_metadata(&dest) {
            // Replace across kinds; directories merge
            if !(is_dir && existing.is_dir()) {
                remove_path(&dest)?;
            }
        }

        if !entry.unpack_in(rootfs)? {
            warn!(path = %rel.display(), "Layer entry rejected during unpack");
        }
    }

    Ok(())
}

/// Apply `layers` (CAS digests) in order onto a fresh `rootfs`.
pub fn materialize(layers: &[String], rootfs: &Path, cas: &CasStore) -> io::Result<()> {
    fs::create_dir_all(rootfs)?;
    for digest in layers {
        debug!(digest = %digest, rootfs = %rootfs.display(), "Applying layer");
        apply_layer(cas.open_blob(digest)?, rootfs)?;
    }
    Ok(())
}

fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
