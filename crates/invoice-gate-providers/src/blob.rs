// crates/invoice-gate-providers/src/blob.rs
// ============================================================================
// Module: Filesystem Blob Store
// Description: A `BlobStore` implementation backed by a rooted directory
//              tree, matching the original system's `storage.py` layout.
// Purpose: Persist raw uploads and stage artifacts to disk.
// Dependencies: invoice_gate_core::interfaces, std::fs
// ============================================================================

//! ## Overview
//! Every path handed to [`FilesystemBlobStore`] is relative to a single
//! root directory fixed at construction time (`storage_root` in config).
//! Paths are rejected outright if any component is `..` or absolute, since
//! blob paths are built from document ids, run ids, and filenames that may
//! originate from user input.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use invoice_gate_core::interfaces::BlobError;
use invoice_gate_core::interfaces::BlobStore;

/// A [`BlobStore`] rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    /// Creates a blob store rooted at `root`. Does not require `root` to
    /// exist yet; it is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves `path` against the store root, rejecting traversal attempts.
    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return Err(BlobError::Io(format!("blob path must be relative: {path}")));
        }
        for component in relative.components() {
            if component.as_os_str() == ".." {
                return Err(BlobError::Io(format!("blob path must not traverse upward: {path}")));
            }
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for FilesystemBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).map_err(|err| BlobError::Io(err.to_string()))?;
        }
        fs::write(&resolved, bytes).map_err(|err| BlobError::Io(err.to_string()))
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        let resolved = self.resolve(path)?;
        match fs::read(&resolved) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound(path.to_string())),
            Err(err) => Err(BlobError::Io(err.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests use unwrap on deterministic fixtures")]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        store.put("raw/doc-1/invoice.pdf", b"hello").unwrap();
        let bytes = store.get("raw/doc-1/invoice.pdf").unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn get_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        let err = store.get("raw/missing.pdf").unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[test]
    fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        let err = store.put("../escape.txt", b"x").unwrap_err();
        assert!(matches!(err, BlobError::Io(_)));
    }
}
