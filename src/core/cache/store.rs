use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

use crate::core::cache::forward_index::ForwardIndex;
use crate::core::cache::pod_lru::PodLru;
use crate::core::hash::BlockHash;

/// A single `(pod, matchLen)` result from `find_top_matches`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub pod: String,
    pub match_len: usize,
}

/// Sharded `model → block-hash → {pods}` map with a per-pod bounded LRU of
/// owned hashes. This is the authoritative local store for prefix/KV cache
/// affinity; an optional distributed backend (`KvBackend`) can be consulted
/// instead by the scoring plugins, see `core::cache::backend`.
pub struct PrefixCacheStore {
    forward: ForwardIndex,
    pod_lru: RwLock<HashMap<String, Mutex<PodLru>>>,
    hash_capacity: usize,
}

impl PrefixCacheStore {
    pub fn new(shard_count: usize, hash_capacity: usize) -> Self {
        Self {
            forward: ForwardIndex::new(shard_count),
            pod_lru: RwLock::new(HashMap::new()),
            hash_capacity,
        }
    }

    fn ensure_pod_lru(&self, pod: &str) {
        if self.pod_lru.read().contains_key(pod) {
            return;
        }
        let mut lrus = self.pod_lru.write();
        lrus.entry(pod.to_string())
            .or_insert_with(|| Mutex::new(PodLru::new(self.hash_capacity)));
    }

    /// Record that `pod` produced these blocks for `model`. Hashes are
    /// walked from the last (longest prefix) to the first so that, if the
    /// per-pod LRU must evict, shorter prefixes are evicted before longer
    /// ones - preserving the invariant that a pod holding hash[i] also
    /// holds every hash[0..i].
    pub fn add(&self, model: &str, hashes: &[BlockHash], pod: &str) {
        if hashes.is_empty() {
            return;
        }
        self.ensure_pod_lru(pod);

        let lrus = self.pod_lru.read();
        let mut lru = lrus.get(pod).expect("pod lru just ensured").lock();

        for &hash in hashes.iter().rev() {
            self.forward.add(model, hash, pod);
            if let Some((evicted_model, evicted_hash)) =
                lru.push((model.to_string(), hash))
            {
                // Don't remove the edge we just added for this exact key.
                if !(evicted_model == model && evicted_hash == hash) {
                    self.forward.remove(&evicted_model, evicted_hash, pod);
                }
            }
        }
    }

    /// Longest-common-prefix match: iterate hashes from the last index down
    /// to 0; the first index at which a still-unmatched candidate pod is
    /// found in the forward index gives that pod's match length
    /// (`index + 1`). Stops once `k` matches are found or the candidate
    /// frontier is exhausted.
    pub fn find_top_matches(
        &self,
        model: &str,
        query_hashes: &[BlockHash],
        candidates: &[String],
        k: usize,
    ) -> Vec<MatchResult> {
        let mut frontier: std::collections::HashSet<String> =
            candidates.iter().cloned().collect();
        let mut results = Vec::new();

        if query_hashes.is_empty() || frontier.is_empty() || k == 0 {
            return results;
        }

        for i in (0..query_hashes.len()).rev() {
            if frontier.is_empty() || results.len() >= k {
                break;
            }
            let pods_for_hash = self.forward.pods_for(model, query_hashes[i]);
            if pods_for_hash.is_empty() {
                continue;
            }
            let matched: Vec<String> = frontier.intersection(&pods_for_hash).cloned().collect();
            for pod in matched {
                frontier.remove(&pod);
                results.push(MatchResult {
                    pod,
                    match_len: i + 1,
                });
                if results.len() >= k {
                    break;
                }
            }
        }

        results
    }

    /// Direct forward-index lookup: every pod that has ever produced this
    /// `(model, hash)` block, regardless of candidacy. Used by `KvBackend`
    /// implementations that wrap this store.
    pub fn pods_for_hash(&self, model: &str, hash: BlockHash) -> std::collections::HashSet<String> {
        self.forward.pods_for(model, hash)
    }

    /// Drop everything this pod owns, removing each edge from the forward
    /// index. Idempotent - deleting an unknown pod is a no-op.
    pub fn on_pod_deleted(&self, pod: &str) {
        let owned_keys = {
            let mut lrus = self.pod_lru.write();
            match lrus.remove(pod) {
                Some(lru) => lru.lock().drain_keys(),
                None => return,
            }
        };

        for (model, hash) in owned_keys {
            self.forward.remove(&model, hash, pod);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::hash_token_blocks;

    #[test]
    fn exact_prefix_match_scores_full_length() {
        let store = PrefixCacheStore::new(4, 1000);
        let tokens: Vec<u32> = (0..384).collect();
        let hashes = hash_token_blocks(&tokens, 128, 128);
        store.add("m1", &hashes, "pod-a");

        let results =
            store.find_top_matches("m1", &hashes, &["pod-a".to_string()], 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].pod, "pod-a");
        assert_eq!(results[0].match_len, hashes.len());
    }

    #[test]
    fn divergent_prefix_is_scored_zero() {
        let store = PrefixCacheStore::new(4, 1000);
        let common: Vec<u32> = (0..256).collect();
        let mut served: Vec<u32> = common.clone();
        served.extend([1, 2, 3, 4]);
        let served_hashes = hash_token_blocks(&served, 128, 128);
        store.add("m1", &served_hashes, "pod-a");

        let mut unrelated: Vec<u32> = vec![9999; 256];
        unrelated.extend([5, 6, 7, 8]);
        let query_hashes = hash_token_blocks(&unrelated, 128, 128);

        let results =
            store.find_top_matches("m1", &query_hashes, &["pod-a".to_string()], 5);
        assert!(results.is_empty());
    }

    #[test]
    fn pod_deletion_removes_all_edges() {
        let store = PrefixCacheStore::new(4, 1000);
        let tokens: Vec<u32> = (0..128).collect();
        let hashes = hash_token_blocks(&tokens, 128, 128);
        store.add("m1", &hashes, "pod-a");
        store.on_pod_deleted("pod-a");

        let results =
            store.find_top_matches("m1", &hashes, &["pod-a".to_string()], 5);
        assert!(results.is_empty());
    }

    #[test]
    fn lru_eviction_bounds_per_pod_footprint() {
        let store = PrefixCacheStore::new(2, 2);
        // three distinct single-block prompts, capacity 2 per pod
        let h1 = hash_token_blocks(&vec![1u32; 128], 128, 128);
        let h2 = hash_token_blocks(&vec![2u32; 128], 128, 128);
        let h3 = hash_token_blocks(&vec![3u32; 128], 128, 128);

        store.add("m1", &h1, "pod-a");
        store.add("m1", &h2, "pod-a");
        store.add("m1", &h3, "pod-a");

        // h1 should have been evicted (oldest)
        let results = store.find_top_matches("m1", &h1, &["pod-a".to_string()], 1);
        assert!(results.is_empty());

        let results = store.find_top_matches("m1", &h3, &["pod-a".to_string()], 1);
        assert_eq!(results.len(), 1);
    }
}
