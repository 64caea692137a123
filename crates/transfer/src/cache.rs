use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chunkflow_protocol::ContentHash;
use lru::LruCache;

/// Process-wide record of content hashes known to be durably stored.
///
/// Cloning shares the same underlying cache. A hit only means the bytes
/// *should* be addressable in the blob store; callers confirm with the
/// store before relying on it.
#[derive(Debug, Clone, Default)]
pub enum BlobCache {
    /// Every lookup misses.
    #[default]
    Disabled,
    /// Fixed-capacity LRU shared between all flows.
    Shared(Arc<Mutex<LruCache<ContentHash, ()>>>),
}

impl BlobCache {
    /// Creates a cache holding at most `capacity` hashes.
    ///
    /// A capacity of zero disables the cache.
    pub fn new(capacity: usize) -> Self {
        let Some(capacity) = NonZeroUsize::new(capacity) else {
            return Self::Disabled;
        };
        Self::Shared(Arc::new(Mutex::new(LruCache::new(capacity))))
    }

    /// Returns `true` if `hash` is known, refreshing its recency.
    pub fn contains(&self, hash: &ContentHash) -> bool {
        match self.lock() {
            Some(mut cache) => cache.get(hash).is_some(),
            None => false,
        }
    }

    /// Records `hash`, evicting the least recently used entry when full.
    pub fn insert(&self, hash: ContentHash) {
        if let Some(mut cache) = self.lock() {
            cache.put(hash, ());
        }
    }

    /// Forgets `hash` (the store turned out not to hold it).
    pub fn remove(&self, hash: &ContentHash) {
        if let Some(mut cache) = self.lock() {
            cache.pop(hash);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().map_or(0, |cache| cache.cap().get())
    }

    fn lock(&self) -> Option<MutexGuard<'_, LruCache<ContentHash, ()>>> {
        match self {
            Self::Disabled => None,
            // The map stays structurally valid even if a holder panicked.
            Self::Shared(cache) => Some(cache.lock().unwrap_or_else(PoisonError::into_inner)),
        }
    }
}
