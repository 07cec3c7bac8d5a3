use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::core::hash::BlockHash;

/// `model → block hash → {pod}`, sharded by `hash mod shard_count` so
/// concurrent reads/writes on unrelated hashes never contend on the same
/// lock.
pub struct ForwardIndex {
    shard_count: usize,
    models: RwLock<HashMap<String, Vec<RwLock<HashMap<BlockHash, HashSet<String>>>>>>,
}

impl ForwardIndex {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
            models: RwLock::new(HashMap::new()),
        }
    }

    fn shard_of(&self, hash: BlockHash) -> usize {
        (hash % self.shard_count as u64) as usize
    }

    fn ensure_model(&self, model: &str) {
        if self.models.read().contains_key(model) {
            return;
        }
        let mut models = self.models.write();
        models.entry(model.to_string()).or_insert_with(|| {
            (0..self.shard_count)
                .map(|_| RwLock::new(HashMap::new()))
                .collect()
        });
    }

    /// Add a `(model, hash) → pod` edge.
    pub fn add(&self, model: &str, hash: BlockHash, pod: &str) {
        self.ensure_model(model);
        let models = self.models.read();
        let shards = models.get(model).expect("model shards just ensured");
        let shard_idx = self.shard_of(hash);
        let mut shard = shards[shard_idx].write();
        shard.entry(hash).or_default().insert(pod.to_string());
    }

    /// Remove a `(model, hash) → pod` edge (called on LRU eviction or pod
    /// deletion). Drops the hash key entirely once its pod set is empty.
    pub fn remove(&self, model: &str, hash: BlockHash, pod: &str) {
        let models = self.models.read();
        let Some(shards) = models.get(model) else {
            return;
        };
        let shard_idx = self.shard_of(hash);
        let mut shard = shards[shard_idx].write();
        if let Some(pods) = shard.get_mut(&hash) {
            pods.remove(pod);
            if pods.is_empty() {
                shard.remove(&hash);
            }
        }
    }

    /// Pods that have ever produced this `(model, hash)` block.
    pub fn pods_for(&self, model: &str, hash: BlockHash) -> HashSet<String> {
        let models = self.models.read();
        let Some(shards) = models.get(model) else {
            return HashSet::new();
        };
        let shard_idx = self.shard_of(hash);
        shards[shard_idx]
            .read()
            .get(&hash)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_query_round_trips() {
        let idx = ForwardIndex::new(4);
        idx.add("m1", 42, "pod-a");
        idx.add("m1", 42, "pod-b");
        let pods = idx.pods_for("m1", 42);
        assert!(pods.contains("pod-a"));
        assert!(pods.contains("pod-b"));
    }

    #[test]
    fn remove_drops_empty_key() {
        let idx = ForwardIndex::new(4);
        idx.add("m1", 42, "pod-a");
        idx.remove("m1", 42, "pod-a");
        assert!(idx.pods_for("m1", 42).is_empty());
    }

    #[test]
    fn unknown_model_returns_empty() {
        let idx = ForwardIndex::new(4);
        assert!(idx.pods_for("ghost", 1).is_empty());
    }
}
