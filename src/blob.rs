//! Byte-addressable storage of the original uploads and their previews.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use log::debug;
use parking_lot::RwLock;

use crate::error::BlobError;

/// Store of byte blobs keyed by relative, `/`-separated paths.
pub trait BlobStore: Send + Sync {
    /// Write `bytes` at `path`, replacing an existing blob.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError>;

    /// Read the blob at `path`.
    fn read(&self, path: &str) -> Result<Vec<u8>, BlobError>;

    /// Remove the blob at `path`. Removing a missing blob is not an error.
    fn delete(&self, path: &str) -> Result<(), BlobError>;

    /// Whether a blob exists at `path`.
    fn exists(&self, path: &str) -> Result<bool, BlobError>;
}

/// Check that `path` is relative and stays below the store root.
pub(crate) fn validate(path: &str) -> Result<&Path, BlobError> {
    let candidate = Path::new(path);
    let normal = candidate.components().all(|c| matches!(c, Component::Normal(_)));
    if path.is_empty() || !normal {
        return Err(BlobError::InvalidPath(path.to_string()));
    }
    Ok(candidate)
}

/// Blobs as files below a root directory.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a store rooted at `root`. The directory is created on the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        Ok(self.root.join(validate(path)?))
    }
}

impl BlobStore for LocalBlobStore {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!("Writing {} bytes to {}.", bytes.len(), target.display());
        fs::write(target, bytes)?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        fs::read(self.resolve(path)?).map_err(|e| match e.kind() {
            ErrorKind::NotFound => BlobError::NotFound(path.to_string()),
            _ => BlobError::Io(e),
        })
    }

    fn delete(&self, path: &str) -> Result<(), BlobError> {
        match fs::remove_file(self.resolve(path)?) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(BlobError::Io(e)),
            _ => Ok(()),
        }
    }

    fn exists(&self, path: &str) -> Result<bool, BlobError> {
        Ok(self.resolve(path)?.is_file())
    }
}

/// Blobs held in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths of all stored blobs, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        validate(path)?;
        self.blobs.write().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        validate(path)?;
        self.blobs
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    fn delete(&self, path: &str) -> Result<(), BlobError> {
        validate(path)?;
        self.blobs.write().remove(path);
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, BlobError> {
        validate(path)?;
        Ok(self.blobs.read().contains_key(path))
    }
}
