//! Decoded epoch cache bounded by in-use lower bounds.

use crate::types::Epoch;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Cache of decoded map epochs.
///
/// Up to `capacity` strong references live in a moka cache with LRU
/// eviction. A weak reference to every epoch handed out is kept besides, so
/// an epoch evicted from moka but still held elsewhere (by a PG, or a
/// shard's current map) is found again by `get` and reported by
/// `cached_lower_bound`. Trimming persisted epochs is bounded by that lower
/// bound, which keeps every epoch a live PG references on disk.
pub struct EpochCache<V> {
    strong: Cache<Epoch, Arc<V>>,
    weak: Mutex<BTreeMap<Epoch, Weak<V>>>,
    capacity: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Send + Sync + 'static> EpochCache<V> {
    /// Create a cache holding at most `capacity` epochs strongly.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1) as u64;
        Self {
            strong: Cache::builder()
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            weak: Mutex::new(BTreeMap::new()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an epoch without touching storage.
    pub fn get(&self, epoch: Epoch) -> Option<Arc<V>> {
        if let Some(value) = self.strong.get(&epoch) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let mut weak = self.weak.lock();
        match weak.get(&epoch).map(Weak::upgrade) {
            Some(Some(value)) => {
                self.strong.insert(epoch, value.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                weak.remove(&epoch);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an epoch, returning the resident instance.
    ///
    /// If the epoch is still alive somewhere, the existing `Arc` is returned
    /// and `value` is dropped so every holder shares one instance.
    pub fn insert(&self, epoch: Epoch, value: V) -> Arc<V> {
        let mut weak = self.weak.lock();

        if let Some(existing) = weak.get(&epoch).and_then(Weak::upgrade) {
            self.strong.insert(epoch, existing.clone());
            return existing;
        }

        let value = Arc::new(value);
        weak.insert(epoch, Arc::downgrade(&value));
        self.strong.insert(epoch, value.clone());
        value
    }

    /// Smallest epoch still resident, in the cache or elsewhere.
    ///
    /// `None` means nothing is resident and there is no in-use bound.
    pub fn cached_lower_bound(&self) -> Option<Epoch> {
        let mut weak = self.weak.lock();
        loop {
            let (epoch, alive) = match weak.iter().next() {
                Some((epoch, held)) => (*epoch, held.strong_count() > 0),
                None => return None,
            };
            if alive {
                return Some(epoch);
            }
            weak.remove(&epoch);
        }
    }

    /// Drop the cache's own strong references below `floor`.
    ///
    /// Epochs held elsewhere stay resident.
    pub fn release_below(&self, floor: Epoch) {
        let released: Vec<Epoch> = self
            .strong
            .iter()
            .map(|(epoch, _)| *epoch)
            .filter(|epoch| *epoch < floor)
            .collect();
        for epoch in &released {
            self.strong.invalidate(epoch);
        }
        self.strong.run_pending_tasks();
        self.weak.lock().retain(|_, held| held.strong_count() > 0);

        if !released.is_empty() {
            debug!(floor, released = released.len(), "Released cached epochs");
        }
    }

    /// Whether the epoch is resident.
    pub fn contains(&self, epoch: Epoch) -> bool {
        self.strong.contains_key(&epoch)
            || self
                .weak
                .lock()
                .get(&epoch)
                .map(|held| held.strong_count() > 0)
                .unwrap_or(false)
    }

    /// Number of strongly cached epochs.
    pub fn len(&self) -> usize {
        self.strong.run_pending_tasks();
        self.strong.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply pending evictions.
    pub fn run_pending_tasks(&self) {
        self.strong.run_pending_tasks();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for EpochCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
