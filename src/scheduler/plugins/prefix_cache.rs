use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::core::cache::KvBackend;
use crate::scheduler::context::{CandidatePod, SchedulingContext};
use crate::scheduler::plugin::ScorePlugin;

/// Scores pods by longest-common-prefix block length against the
/// request's already-computed block hashes, normalized to `0..100`.
/// Queries `backend` once per block (from the last block down to the
/// first) rather than the local store directly, so this plugin works
/// unmodified against a distributed (Redis) backend too.
pub struct PrefixCachePlugin {
    backend: Arc<dyn KvBackend>,
    block_size_to_hash: usize,
    max_blocks_to_match: usize,
}

impl PrefixCachePlugin {
    pub fn new(backend: Arc<dyn KvBackend>, block_size_to_hash: usize, max_blocks_to_match: usize) -> Self {
        Self {
            backend,
            block_size_to_hash,
            max_blocks_to_match,
        }
    }
}

#[async_trait]
impl ScorePlugin for PrefixCachePlugin {
    fn name(&self) -> &str {
        "prefix-cache"
    }

    async fn score(&self, ctx: &SchedulingContext, pods: &[CandidatePod]) -> HashMap<String, f64> {
        // Relies on the caller having already populated `ctx`'s memoized
        // block hashes via `SchedulingContext::block_hashes` with the
        // request's real tokens; an empty slice here is a no-op read of
        // that cache, not a fresh (re-)tokenization.
        let hashes = ctx.block_hashes(&[], self.block_size_to_hash, self.max_blocks_to_match);
        if hashes.is_empty() {
            return HashMap::new();
        }

        let mut frontier: HashSet<String> = pods.iter().map(|p| p.key.clone()).collect();
        let mut match_len: HashMap<String, usize> = HashMap::new();

        for i in (0..hashes.len()).rev() {
            if frontier.is_empty() {
                break;
            }
            let pods_for_hash = match self.backend.pods_for(&ctx.model, hashes[i]).await {
                Ok(set) => set,
                Err(e) => {
                    warn!(error = %e, "prefix-cache backend error, scoring all pods 0");
                    return HashMap::new();
                }
            };
            if pods_for_hash.is_empty() {
                continue;
            }
            let matched: Vec<String> = frontier.intersection(&pods_for_hash).cloned().collect();
            for pod in matched {
                frontier.remove(&pod);
                match_len.insert(pod, i + 1);
            }
        }

        let total = hashes.len() as f64;
        match_len
            .into_iter()
            .map(|(pod, len)| (pod, (len as f64 / total) * 100.0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::PrefixCacheStore;
    use crate::core::cache::backend::LocalKvBackend;
    use crate::core::hash::hash_token_blocks;
    use crate::scheduler::context::PromptInput;

    fn pod(key: &str) -> CandidatePod {
        CandidatePod {
            key: key.to_string(),
            request_waiting_num: 0,
            request_running_num: 0,
            gpu_cache_usage: 0.0,
            tpot: 0.0,
            ttft: 0.0,
            models: Default::default(),
        }
    }

    #[tokio::test]
    async fn full_prefix_match_scores_100() {
        let store = Arc::new(PrefixCacheStore::new(4, 1000));
        let tokens: Vec<u32> = (0..128).collect();
        let hashes = hash_token_blocks(&tokens, 128, 128);
        store.add("m1", &hashes, "pod-a");
        let backend: Arc<dyn KvBackend> = Arc::new(LocalKvBackend::new(store));

        let plugin = PrefixCachePlugin::new(backend, 128, 128);
        let ctx = SchedulingContext::new("m1", PromptInput::Text("x".into()), "u", "r");
        ctx.block_hashes(&tokens, 128, 128);

        let scores = plugin.score(&ctx, &[pod("pod-a"), pod("pod-b")]).await;
        assert_eq!(scores.get("pod-a"), Some(&100.0));
        assert!(scores.get("pod-b").is_none());
    }

    #[tokio::test]
    async fn no_hashes_yields_empty_scores() {
        let store = Arc::new(PrefixCacheStore::new(4, 1000));
        let backend: Arc<dyn KvBackend> = Arc::new(LocalKvBackend::new(store));
        let plugin = PrefixCachePlugin::new(backend, 128, 128);
        let ctx = SchedulingContext::new("m1", PromptInput::Text("x".into()), "u", "r");
        ctx.block_hashes(&[], 128, 128);
        let scores = plugin.score(&ctx, &[pod("pod-a")]).await;
        assert!(scores.is_empty());
    }
}
