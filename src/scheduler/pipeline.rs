use std::collections::HashMap;
use std::sync::Arc;

use crate::scheduler::context::{CandidatePod, ScheduleDecision, SchedulingContext};
use crate::scheduler::plugin::{FilterPlugin, PostHook, ScorePlugin};

/// A scorer plugin paired with its configured combination weight. Negative
/// weights are clamped to 0 at construction time (SPEC_FULL.md §4.2).
pub struct WeightedScorer {
    pub plugin: Arc<dyn ScorePlugin>,
    pub weight: f64,
}

impl WeightedScorer {
    pub fn new(plugin: Arc<dyn ScorePlugin>, weight: f64) -> Self {
        Self {
            plugin,
            weight: weight.max(0.0),
        }
    }
}

/// One ordered filter → score → combine pipeline. Built once at startup
/// from the plugin registry and the configured filter/scorer lists, then
/// reused across requests - plugin instances carry no per-request state.
pub struct SchedulingPipeline {
    filters: Vec<Arc<dyn FilterPlugin>>,
    scorers: Vec<WeightedScorer>,
    post_hooks: Vec<Arc<dyn PostHook>>,
}

impl SchedulingPipeline {
    pub fn new(
        filters: Vec<Arc<dyn FilterPlugin>>,
        scorers: Vec<WeightedScorer>,
        post_hooks: Vec<Arc<dyn PostHook>>,
    ) -> Self {
        Self {
            filters,
            scorers,
            post_hooks,
        }
    }

    /// Run filters in configured order (short-circuiting once the
    /// candidate list is empty), then run every scorer and combine
    /// `Σ wᵢ · sᵢ` per pod. Returns the winning pod, or `None` if no
    /// candidate survives filtering.
    pub async fn select(&self, ctx: &SchedulingContext, candidates: Vec<CandidatePod>) -> Option<CandidatePod> {
        let mut pods = candidates;
        for filter in &self.filters {
            if pods.is_empty() {
                break;
            }
            pods = filter.filter(ctx, pods).await;
        }
        if pods.is_empty() {
            return None;
        }

        let mut combined: HashMap<String, f64> = HashMap::new();
        for scorer in &self.scorers {
            if scorer.weight == 0.0 {
                continue;
            }
            let scores = scorer.plugin.score(ctx, &pods).await;
            for pod in &pods {
                let s = scores.get(&pod.key).copied().unwrap_or(0.0);
                *combined.entry(pod.key.clone()).or_insert(0.0) += scorer.weight * s;
            }
        }

        // Highest combined score wins; ties break by pod name (SPEC_FULL.md
        // §4.2), so the outcome is independent of candidate order even when
        // callers build the candidate list from an unordered map.
        let mut best_idx = 0usize;
        let mut best_score = combined.get(&pods[0].key).copied().unwrap_or(0.0);
        for (idx, pod) in pods.iter().enumerate().skip(1) {
            let score = combined.get(&pod.key).copied().unwrap_or(0.0);
            if score > best_score || (score == best_score && pod.key < pods[best_idx].key) {
                best_score = score;
                best_idx = idx;
            }
        }
        Some(pods[best_idx].clone())
    }

    /// Invoke every post-hook with the final decision.
    pub async fn run_post_hooks(&self, ctx: &SchedulingContext, decision: &ScheduleDecision) {
        for hook in &self.post_hooks {
            hook.run(ctx, decision).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::context::PromptInput;
    use async_trait::async_trait;

    struct AllPassFilter;
    #[async_trait]
    impl FilterPlugin for AllPassFilter {
        fn name(&self) -> &str {
            "all-pass"
        }
        async fn filter(&self, _ctx: &SchedulingContext, pods: Vec<CandidatePod>) -> Vec<CandidatePod> {
            pods
        }
    }

    struct FixedScorer(HashMap<String, f64>);
    #[async_trait]
    impl ScorePlugin for FixedScorer {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn score(&self, _ctx: &SchedulingContext, _pods: &[CandidatePod]) -> HashMap<String, f64> {
            self.0.clone()
        }
    }

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
    async fn highest_combined_score_wins() {
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), 10.0);
        scores.insert("b".to_string(), 90.0);
        let pipeline = SchedulingPipeline::new(
            vec![Arc::new(AllPassFilter)],
            vec![WeightedScorer::new(Arc::new(FixedScorer(scores)), 1.0)],
            vec![],
        );
        let ctx = SchedulingContext::new("m1", PromptInput::Text("x".into()), "u1", "r1");
        let winner = pipeline.select(&ctx, vec![pod("a"), pod("b")]).await.unwrap();
        assert_eq!(winner.key, "b");
    }

    #[tokio::test]
    async fn ties_break_by_pod_name() {
        let scores = HashMap::new(); // everyone scores 0
        let pipeline = SchedulingPipeline::new(
            vec![Arc::new(AllPassFilter)],
            vec![WeightedScorer::new(Arc::new(FixedScorer(scores)), 1.0)],
            vec![],
        );
        let ctx = SchedulingContext::new("m1", PromptInput::Text("x".into()), "u1", "r1");
        // Candidate order is reversed relative to name order; the winner
        // must still be the lexicographically smallest name.
        let winner = pipeline.select(&ctx, vec![pod("b"), pod("a")]).await.unwrap();
        assert_eq!(winner.key, "a");
    }

    #[tokio::test]
    async fn negative_weight_is_clamped_to_zero() {
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), 100.0);
        let scorer = WeightedScorer::new(Arc::new(FixedScorer(scores)), -5.0);
        assert_eq!(scorer.weight, 0.0);
    }
}
