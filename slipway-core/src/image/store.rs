//! Local image storage.
//!
//! ```text
//! images/<id>.json         immutable image records
//! refs/<name>/@tags/<tag>  tag files holding an image id
//! ```
//!
//! A tag is only ever written by renaming a fully written temporary file over
//! it, so readers see either the old image or the new one.

use super::{ImageRecord, ImageReference};
use crate::error::{Result, SlipwayError};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Holds a name's tag files. `@` cannot appear in an image name, so a nested
/// name (`team/x`) never collides with a tag (`team:x`).
const TAGS_DIR: &str = "@tags";

#[derive(Debug, Clone)]
pub struct ImageStore {
    images_dir: PathBuf,
    refs_dir: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SlipwayError + '_ {
    move |source| SlipwayError::IoError { path: path.to_path_buf(), source }
}

impl ImageStore {
    pub fn open(root: &Path) -> Result<Self> {
        let images_dir = root.join("images");
        let refs_dir = root.join("refs");
        fs::create_dir_all(&images_dir).map_err(io_err(&images_dir))?;
        fs::create_dir_all(&refs_dir).map_err(io_err(&refs_dir))?;
        Ok(Self { images_dir, refs_dir })
    }

    /// Persist the record, then point its tag at it.
    pub fn commit(&self, record: &ImageRecord) -> Result<()> {
        let record_path = self.images_dir.join(format!("{}.json", record.id));
        let json = serde_json::to_vec_pretty(record).map_err(SlipwayError::internal)?;
        write_atomic(&self.images_dir, &record_path, &json)?;

        let tag_path = self.tag_path(&record.reference);
        let tag_dir = tag_path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.refs_dir.clone());
        fs::create_dir_all(&tag_dir).map_err(io_err(&tag_dir))?;
        write_atomic(&tag_dir, &tag_path, record.id.as_bytes())?;

        info!(image = %record.reference, id = %record.short_id(), "Tagged image");
        Ok(())
    }

    /// Look up the image a tag points at.
    pub fn resolve(&self, reference: &ImageReference) -> Result<ImageRecord> {
        let tag_path = self.tag_path(reference);
        let id = match fs::read_to_string(&tag_path) {
            Ok(id) => id.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SlipwayError::ImageNotFound { image: reference.to_string() })
            }
            Err(e) => return Err(SlipwayError::IoError { path: tag_path, source: e }),
        };

        self.load(&id)
    }

    /// Load an image record by id.
    pub fn load(&self, id: &str) -> Result<ImageRecord> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SlipwayError::CorruptImage { id: id.to_string(), reason: "malformed image id".into() });
        }

        let path = self.images_dir.join(format!("{}.json", id));
        let data = fs::read(&path).map_err(|e| SlipwayError::CorruptImage {
            id: id.to_string(),
            reason: format!("record unreadable: {}", e),
        })?;
        let record: ImageRecord = serde_json::from_slice(&data)
            .map_err(|e| SlipwayError::CorruptImage { id: id.to_string(), reason: e.to_string() })?;

        if record.compute_id() != record.id {
            return Err(SlipwayError::CorruptImage { id: id.to_string(), reason: "content does not match id".into() });
        }

        debug!(image = %record.reference, id = %id, "Loaded image record");
        Ok(record)
    }

    /// Tagged images sorted by reference.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let mut images = Vec::new();

        for reference in self.list_refs()? {
            match self.resolve(&reference) {
                Ok(record) => images.push(record),
                Err(e) => warn!(image = %reference, error = %e, "Skipping unreadable image"),
            }
        }

        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(images)
    }

    /// Remove a tag. The record stays until garbage collection.
    pub fn untag(&self, reference: &ImageReference) -> Result<()> {
        let tag_path = self.tag_path(reference);
        match fs::remove_file(&tag_path) {
            Ok(()) => {
                info!(image = %reference, "Removed tag");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SlipwayError::ImageNotFound { image: reference.to_string() })
            }
            Err(e) => Err(SlipwayError::IoError { path: tag_path, source: e }),
        }
    }

    /// Layer digests of every tagged image.
    pub fn referenced_layers(&self) -> Result<HashSet<String>> {
        Ok(self.list()?.iter().flat_map(|r| r.layer_digests()).collect())
    }

    /// Delete records no tag points at. Returns how many were removed.
    pub fn prune_untagged(&self) -> Result<usize> {
        let tagged: HashSet<String> = self.list()?.into_iter().map(|r| r.id).collect();
        let mut removed = 0;

        for entry in fs::read_dir(&self.images_dir).map_err(io_err(&self.images_dir))? {
            let path = entry.map_err(io_err(&self.images_dir))?.path();
            let id = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
            if path.extension().map(|e| e == "json").unwrap_or(false) && !tagged.contains(&id) {
                fs::remove_file(&path).map_err(io_err(&path))?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn list_refs(&self) -> Result<Vec<ImageReference>> {
        let mut refs = Vec::new();
        collect_refs(&self.refs_dir, &self.refs_dir, &mut refs)?;
        Ok(refs)
    }

    fn tag_path(&self, reference: &ImageReference) -> PathBuf {
        self.refs_dir.join(&reference.name).join(TAGS_DIR).join(&reference.tag)
    }
}

/// Walks `refs/`: directories are name components, each name's tags live
/// in its `@tags` directory.
fn collect_refs(refs_dir: &Path, dir: &Path, out: &mut Vec<ImageReference>) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if !path.is_dir() {
            continue;
        }
        if path.file_name().is_some_and(|n| n == TAGS_DIR) {
            collect_tags(refs_dir, &path, out)?;
        } else {
            collect_refs(refs_dir, &path, out)?;
        }
    }
    Ok(())
}

fn collect_tags(refs_dir: &Path, tags_dir: &Path, out: &mut Vec<ImageReference>) -> Result<()> {
    let Some(name) = tags_dir.parent().and_then(|p| p.strip_prefix(refs_dir).ok()) else {
        return Ok(());
    };

    for entry in fs::read_dir(tags_dir).map_err(io_err(tags_dir))? {
        let path = entry.map_err(io_err(tags_dir))?.path();
        let Some(tag) = path.file_name().and_then(|t| t.to_str()) else { continue };
        // Leftover temp files from an interrupted commit
        if tag.starts_with(".tmp") || !path.is_file() {
            continue;
        }
        let reference = format!("{}:{}", name.to_string_lossy(), tag);
        match ImageReference::parse(&reference) {
            Ok(r) => out.push(r),
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring malformed tag"),
        }
    }
    Ok(())
}

fn write_atomic(dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    let mut staged = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    staged.write_all(data).map_err(io_err(target))?;
    staged.as_file().sync_all().map_err(io_err(target))?;
    staged.persist(target).map_err(|e| SlipwayError::IoError { path: target.to_path_buf(), source: e.error })?;
    Ok(())
}
