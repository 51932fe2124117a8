//! Content-addressable blob storage for layers.
//!
//! Blobs are named by the sha256 of their content, so identical layers
//! produced by different builds are stored once.
//!
//! # Layout
//!
//! ```text
//! blobs/
//! └── sha256/
//!     ├── a1/
//!     │   └── a1b2c3...  # Layer tarball (named by digest)
//!     └── ...
//! ```
//!
//! Writes go to a temporary file in the store and are renamed into place, so
//! a blob path either holds the complete content or does not exist.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Content-addressable storage manager.
#[derive(Debug, Clone)]
pub struct CasStore {
    /// Root directory for blob storage
    blobs_dir: PathBuf,
    /// Staging directory on the same filesystem as `blobs_dir`
    tmp_dir: PathBuf,
}

impl CasStore {
    /// Open (creating if needed) a store under `base_dir`.
    pub fn new(base_dir: &Path) -> io::Result<Self> {
        let blobs_dir = base_dir.join("blobs").join("sha256");
        let tmp_dir = base_dir.join("blobs").join("tmp");

        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self { blobs_dir, tmp_dir })
    }

    /// Store a blob and return its digest.
    ///
    /// If the blob already exists, this is a no-op and just returns the digest.
    pub fn store_blob(&self, data: &[u8]) -> io::Result<String> {
        let digest = format!("{:x}", Sha256::digest(data));

        if self.blob_exists(&digest) {
            debug!(digest = %digest, "Blob already exists");
            return Ok(digest);
        }

        let mut staged = self.staging_file()?;
        staged.write_all(data)?;
        self.commit(staged, &digest)?;

        debug!(digest = %digest, size = data.len(), "Stored new blob");
        Ok(digest)
    }

    /// Stream `reader` into the store, hashing as it goes.
    ///
    /// Returns the digest and size in bytes.
    pub fn store_reader<R: Read>(&self, mut reader: R) -> io::Result<(String, u64)> {
        let mut writer = self.blob_writer()?;
        io::copy(&mut reader, &mut writer)?;
        writer.finish()
    }

    /// Store the contents of a file already on disk.
    pub fn store_file(&self, path: &Path) -> io::Result<(String, u64)> {
        self.store_reader(File::open(path)?)
    }

    /// A writer that stages a new blob and hashes it in the same pass.
    /// [`BlobWriter::finish`] moves it into place.
    pub fn blob_writer(&self) -> io::Result<BlobWriter> {
        Ok(BlobWriter {
            store: self.clone(),
            staged: BufWriter::new(self.staging_file()?),
            hasher: Sha256::new(),
            size: 0,
        })
    }

    fn staging_file(&self) -> io::Result<NamedTempFile> {
        NamedTempFile::new_in(&self.tmp_dir)
    }

    fn commit(&self, staged: NamedTempFile, digest: &str) -> io::Result<()> {
        staged.as_file().sync_all()?;
        let target = self.blob_path(digest)?;
        staged.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    /// Retrieve a blob by digest.
    pub fn get_blob(&self, digest: &str) -> io::Result<Vec<u8>> {
        fs::read(self.blob_path(digest)?)
    }

    /// Open a blob for streaming reads.
    pub fn open_blob(&self, digest: &str) -> io::Result<File> {
        File::open(self.blob_path(digest)?)
    }

    /// Check if a blob exists.
    pub fn blob_exists(&self, digest: &str) -> bool {
        self.blob_path(digest).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Size of a stored blob.
    pub fn blob_size(&self, digest: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.blob_path(digest)?)?.len())
    }

    /// Get the total size of all blobs.
    pub fn total_blob_size(&self) -> io::Result<u64> {
        Ok(self.list_blobs()?.iter().map(|(_, size)| size).sum())
    }

    /// Get the number of unique blobs.
    pub fn blob_count(&self) -> io::Result<usize> {
        Ok(self.list_blobs()?.len())
    }

    /// Every stored digest with its size.
    pub fn list_blobs(&self) -> io::Result<Vec<(String, u64)>> {
        let mut blobs = Vec::new();

        for subdir in fs::read_dir(&self.blobs_dir)? {
            let subdir = subdir?;
            if !subdir.path().is_dir() {
                continue;
            }
            for blob in fs::read_dir(subdir.path())? {
                let blob = blob?;
                if let Some(digest) = blob.file_name().to_str() {
                    blobs.push((digest.to_string(), blob.metadata()?.len()));
                }
            }
        }

        blobs.sort();
        Ok(blobs)
    }

    /// Get the path for a blob.
    fn blob_path(&self, digest: &str) -> io::Result<PathBuf> {
        if digest.len() < 2 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid blob digest: {}", digest)));
        }
        // First 2 chars as subdirectory for better filesystem performance
        let dir = self.blobs_dir.join(&digest[..2]);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(digest))
    }

    /// Remove every blob not in `referenced`, plus abandoned staging files.
    ///
    /// Returns the number of blobs removed.
    pub fn gc(&self, referenced: &HashSet<String>) -> io::Result<usize> {
        let mut removed = 0;

        for (digest, _) in self.list_blobs()? {
            if !referenced.contains(&digest) {
                fs::remove_file(self.blob_path(&digest)?)?;
                removed += 1;
            }
        }

        for entry in fs::read_dir(&self.tmp_dir)? {
            let _ = fs::remove_file(entry?.path());
        }

        if removed > 0 {
            info!(removed, "Garbage collected unreferenced blobs");
        }

        Ok(removed)
    }
}

/// Blob being written into a [`CasStore`].
pub struct BlobWriter {
    store: CasStore,
    staged: BufWriter<NamedTempFile>,
    hasher: Sha256,
    size: u64,
}

impl BlobWriter {
    /// Commit the blob. Returns its digest and size in bytes.
    pub fn finish(self) -> io::Result<(String, u64)> {
        let digest = format!("{:x}", self.hasher.finalize());
        let staged = self.staged.into_inner().map_err(|e| e.into_error())?;

        if self.store.blob_exists(&digest) {
            debug!(digest = %digest, "Blob already exists");
        } else {
            self.store.commit(staged, &digest)?;
            debug!(digest = %digest, size = self.size, "Stored new blob");
        }

        Ok((digest, self.size))
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.staged.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staged.flush()
    }
}
