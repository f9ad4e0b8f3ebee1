//! Moka-backed caches of encoded map bytes.

use crate::types::Epoch;
use bytes::Bytes;
use moka::sync::Cache;

/// Bounded cache of encoded maps keyed by epoch.
///
/// Used twice by the authority: once for full encodings, once for
/// incremental encodings.
pub struct EncodedMapCache {
    cache: Cache<Epoch, Bytes>,
}

impl EncodedMapCache {
    /// Create a cache holding at most `capacity` encodings.
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub fn get(&self, epoch: Epoch) -> Option<Bytes> {
        self.cache.get(&epoch)
    }

    pub fn insert(&self, epoch: Epoch, bytes: Bytes) {
        self.cache.insert(epoch, bytes);
    }

    pub fn invalidate(&self, epoch: Epoch) {
        self.cache.invalidate(&epoch);
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        self.cache.contains_key(&epoch)
    }
}

impl std::fmt::Debug for EncodedMapCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedMapCache")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}
