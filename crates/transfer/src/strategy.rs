//! Per-chunk policies.
//!
//! A strategy decides, before a chunk's payload is requested, whether the
//! payload is needed at all. The plain strategy always fetches; the fast
//! strategy asks the endpoint for the chunk's hash and links known
//! content by reference.

use std::sync::Arc;

use chunkflow_protocol::{ContentHash, PathSpec};
use tracing::trace;

use crate::cache::BlobCache;
use crate::endpoint::{ActionFuture, EndpointActions};
use crate::store::BlobStore;
use crate::types::ChunkRange;

/// Outcome of resolving one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The payload must be read from the endpoint.
    Fetch,
    /// The content is already stored under this hash.
    Satisfied(ContentHash),
}

/// Chunk policy plugged into a transfer session.
pub trait ChunkStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Decides how the chunk at `range` is obtained.
    fn resolve<'a>(
        &'a self,
        endpoint: &'a dyn EndpointActions,
        pathspec: &'a PathSpec,
        range: ChunkRange,
    ) -> ActionFuture<'a, Resolution>;

    /// Called after a fetched payload was durably stored.
    fn chunk_stored(&self, _hash: &ContentHash) {}
}

/// Reads every chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainStrategy;

impl ChunkStrategy for PlainStrategy {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn resolve<'a>(
        &'a self,
        _endpoint: &'a dyn EndpointActions,
        _pathspec: &'a PathSpec,
        _range: ChunkRange,
    ) -> ActionFuture<'a, Resolution> {
        Box::pin(async { Ok(Resolution::Fetch) })
    }
}

/// Hashes each chunk remotely and skips content the server already holds.
///
/// A cache hit is confirmed against the blob store before the chunk is
/// treated as satisfied; stale entries are dropped from the cache.
pub struct FastStrategy {
    cache: BlobCache,
    blobs: Arc<dyn BlobStore>,
}

impl FastStrategy {
    pub fn new(cache: BlobCache, blobs: Arc<dyn BlobStore>) -> Self {
        Self { cache, blobs }
    }

    fn lookup(&self, hash: ContentHash) -> Resolution {
        let cached = self.cache.contains(&hash);
        // A store error is treated as absence; the chunk is simply fetched.
        let stored = self.blobs.has(&hash).unwrap_or(false);
        match (cached, stored) {
            (_, true) => {
                if !cached {
                    self.cache.insert(hash);
                }
                trace!(%hash, cached, "chunk content already stored");
                Resolution::Satisfied(hash)
            }
            (true, false) => {
                trace!(%hash, "stale cache entry dropped");
                self.cache.remove(&hash);
                Resolution::Fetch
            }
            (false, false) => Resolution::Fetch,
        }
    }
}

impl ChunkStrategy for FastStrategy {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn resolve<'a>(
        &'a self,
        endpoint: &'a dyn EndpointActions,
        pathspec: &'a PathSpec,
        range: ChunkRange,
    ) -> ActionFuture<'a, Resolution> {
        Box::pin(async move {
            let hash = endpoint
                .hash_range(pathspec, range.offset, range.length)
                .await?;
            Ok(self.lookup(hash))
        })
    }

    fn chunk_stored(&self, hash: &ContentHash) {
        self.cache.insert(*hash);
    }
}
