//! Content-addressed durable blob storage.
//!
//! Blobs are keyed by the SHA-256 of their bytes. The in-memory store
//! backs tests and short-lived servers; [`FsBlobStore`] keeps blobs under
//! `<root>/<first two hex chars>/<hex hash>`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chunkflow_protocol::ContentHash;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Errors from blob and file storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob not present: {0}")]
    BlobMissing(ContentHash),

    #[error("stored blob does not match its hash: {0}")]
    Corrupt(ContentHash),
}

/// Durable store of chunk payloads addressed by content hash.
pub trait BlobStore: Send + Sync {
    /// Returns `true` if the bytes for `hash` are stored.
    fn has(&self, hash: &ContentHash) -> Result<bool, StoreError>;

    /// Stores `data` under `hash`. Storing an existing hash is a no-op.
    fn put(&self, hash: ContentHash, data: &[u8]) -> Result<(), StoreError>;

    /// Loads the bytes for `hash`, or `None` if absent.
    fn get(&self, hash: &ContentHash) -> Result<Option<Arc<[u8]>>, StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// Blob store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<ContentHash, Arc<[u8]>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs stored.
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops a blob, leaving any references to it dangling.
    pub fn evict(&self, hash: &ContentHash) -> bool {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash)
            .is_some()
    }
}

impl BlobStore for MemoryBlobStore {
    fn has(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.contains_key(hash))
    }

    fn put(&self, hash: ContentHash, data: &[u8]) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.entry(hash).or_insert_with(|| Arc::from(data));
        Ok(())
    }

    fn get(&self, hash: &ContentHash) -> Result<Option<Arc<[u8]>>, StoreError> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(hash).cloned())
    }
}

// ---------------------------------------------------------------------------
// FsBlobStore
// ---------------------------------------------------------------------------

/// Blob store on the local filesystem.
///
/// Writes go to a temporary file that is renamed into place, so a blob
/// path either holds the full payload or does not exist.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        debug!(root = %root.display(), "opened blob store");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }
}

impl BlobStore for FsBlobStore {
    fn has(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        Ok(self.blob_path(hash).is_file())
    }

    fn put(&self, hash: ContentHash, data: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(&hash);
        if path.is_file() {
            trace!(%hash, "blob already stored");
            return Ok(());
        }
        let Some(dir) = path.parent() else {
            return Err(StoreError::Io(std::io::Error::other("blob path has no parent")));
        };
        std::fs::create_dir_all(dir)?;

        // Each writer gets its own temp file; no fsync, a blob lost in a
        // crash is fetched again by the next transfer.
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        match tmp.persist(&path) {
            Ok(_) => trace!(%hash, bytes = data.len(), "blob stored"),
            // Same content, so a concurrent writer that got there first wins.
            Err(_) if path.is_file() => trace!(%hash, "blob stored concurrently"),
            Err(e) => return Err(e.error.into()),
        }
        Ok(())
    }

    fn get(&self, hash: &ContentHash) -> Result<Option<Arc<[u8]>>, StoreError> {
        let data = match std::fs::read(self.blob_path(hash)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if ContentHash::digest(&data) != *hash {
            return Err(StoreError::Corrupt(*hash));
        }
        Ok(Some(Arc::from(data)))
    }
}
