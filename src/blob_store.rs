//! Content-addressed blob storage.
//!
//! The packer never touches a blob directory directly; it goes through [`BlobStore`],
//! so the same pipeline can stage blobs on disk ([`FsBlobStore`]) or in memory
//! ([`MemoryBlobStore`]). Writes are idempotent per digest: identical digest means
//! identical content, so concurrent writers of the same blob cannot conflict.

use crate::archive::BLOBS_DIR;
use crate::error::{io_at, ArchiveError, Result};
use oci_spec::image::Digest;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `digest`. Storing an already present digest is a no-op.
    fn put(&self, digest: &Digest, bytes: &[u8]) -> Result<()>;

    /// Returns the blob stored under `digest`, if any.
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>>;

    fn contains(&self, digest: &Digest) -> bool;
}

/// Blobs laid out as `<root>/blobs/sha256/<hex>`.
pub struct FsBlobStore {
    blobs_dir: PathBuf,
}

impl FsBlobStore {
    pub fn create(root: &Path) -> Result<Self> {
        let blobs_dir = root.join(BLOBS_DIR);
        fs::create_dir_all(&blobs_dir).map_err(io_at(&blobs_dir))?;
        Ok(Self { blobs_dir })
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir.join(digest.digest())
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let dest = self.blob_path(digest);
        if dest.exists() {
            log::trace!("blob {} already staged", digest);
            return Ok(());
        }
        let mut staged =
            tempfile::NamedTempFile::new_in(&self.blobs_dir).map_err(io_at(&self.blobs_dir))?;
        staged.write_all(bytes).map_err(io_at(staged.path()))?;
        match staged.persist_noclobber(&dest) {
            Ok(_) => Ok(()),
            // Another worker won the race with the same content.
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(ArchiveError::IoAt {
                path: dest,
                source: err.error,
            }),
        }
    }

    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(digest);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ArchiveError::IoAt { path, source: err }),
        }
    }

    fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A poisoned map still holds complete blobs; writes are single inserts.
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        self.lock()
            .entry(digest.to_string())
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(&digest.to_string()).cloned())
    }

    fn contains(&self, digest: &Digest) -> bool {
        self.lock().contains_key(&digest.to_string())
    }
}
