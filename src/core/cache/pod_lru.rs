use lru::LruCache;
use std::num::NonZeroUsize;

use crate::core::hash::BlockHash;

/// Key owned by a pod's per-pod LRU: the (model, hash) pair it produced.
pub type OwnedKey = (String, BlockHash);

/// Bounded LRU of `(model, hash)` keys a single pod currently holds.
/// Wraps `lru::LruCache`, exposing `push` so callers can react to the
/// evicted entry (removing it from the forward index).
pub struct PodLru {
    inner: LruCache<OwnedKey, ()>,
}

impl PodLru {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: LruCache::new(cap),
        }
    }

    /// Insert/touch a key. Returns the evicted key if the cache was at
    /// capacity, so the caller can remove the corresponding forward-index
    /// edge. `lru::LruCache::push` never evicts the key it just inserted
    /// since capacity is always >= 1.
    pub fn push(&mut self, key: OwnedKey) -> Option<OwnedKey> {
        self.inner.push(key, ()).map(|(evicted_key, _)| evicted_key)
    }

    pub fn contains(&self, key: &OwnedKey) -> bool {
        self.inner.contains(key)
    }

    pub fn drain_keys(&mut self) -> Vec<OwnedKey> {
        self.inner.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
