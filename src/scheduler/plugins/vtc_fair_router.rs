use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use crate::core::tracker::TokenTracker;
use crate::scheduler::context::{CandidatePod, SchedulingContext};
use crate::scheduler::plugin::ScorePlugin;

/// Virtual Token Counter fairness scorer. Maps each user's recent token
/// consumption to a preferred position in the candidate list, then scores
/// every pod by how far its actual position is from that preference,
/// blended with load utilization and a small random jitter.
pub struct VtcFairRouterPlugin {
    tracker: Arc<TokenTracker>,
    min_token_bucket: f64,
    max_load: f64,
    fairness_weight: f64,
    utilization_weight: f64,
    random_weight: f64,
}

impl VtcFairRouterPlugin {
    pub fn new(
        tracker: Arc<TokenTracker>,
        min_token_bucket: f64,
        max_load: f64,
        fairness_weight: f64,
        utilization_weight: f64,
        random_weight: f64,
    ) -> Self {
        Self {
            tracker,
            min_token_bucket,
            max_load: max_load.max(1.0),
            fairness_weight,
            utilization_weight,
            random_weight,
        }
    }
}

#[async_trait]
impl ScorePlugin for VtcFairRouterPlugin {
    fn name(&self) -> &str {
        "vtc-fair-router"
    }

    async fn score(&self, ctx: &SchedulingContext, pods: &[CandidatePod]) -> HashMap<String, f64> {
        if pods.is_empty() {
            return HashMap::new();
        }
        let n = pods.len() as f64;

        let min_tokens = self.tracker.min_token_count();
        let max_tokens = self.tracker.max_token_count();
        let bucket = (min_tokens + max_tokens) / 2.0;
        let bucket = bucket.max(self.min_token_bucket);

        let user_tokens = self.tracker.get_token_count(&ctx.user_id, &ctx.model);
        let norm = (user_tokens / bucket).min(n - 1.0).max(0.0);

        let mut rng = rand::thread_rng();
        let raw: Vec<f64> = pods
            .iter()
            .enumerate()
            .map(|(i, pod)| {
                let fairness = (i as f64 - norm).abs();
                let util = (pod.request_running_num as f64 / self.max_load).min(1.0);
                let jitter: f64 = rng.gen_range(0.0..1.0);
                self.fairness_weight * fairness + self.utilization_weight * util + self.random_weight * jitter
            })
            .collect();

        let min_raw = raw.iter().cloned().fold(f64::MAX, f64::min);
        let max_raw = raw.iter().cloned().fold(f64::MIN, f64::max);

        pods.iter()
            .zip(raw.iter())
            .map(|(pod, r)| {
                let score = if (max_raw - min_raw).abs() < f64::EPSILON {
                    100.0
                } else {
                    100.0 * (max_raw - r) / (max_raw - min_raw)
                };
                (pod.key.clone(), score)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeUnit;
    use crate::scheduler::context::PromptInput;

    fn pod(key: &str, running: u64) -> CandidatePod {
        CandidatePod {
            key: key.to_string(),
            request_waiting_num: 0,
            request_running_num: running,
            gpu_cache_usage: 0.0,
            tpot: 0.0,
            ttft: 0.0,
            models: Default::default(),
        }
    }

    #[tokio::test]
    async fn heavy_user_prefers_later_indices() {
        let tracker = Arc::new(TokenTracker::new(60, TimeUnit::Seconds, 1.0, 1.0));
        tracker.update_token_count("light", "m", 1.0, 0.0);
        tracker.update_token_count("heavy", "m", 1000.0, 0.0);

        let plugin = VtcFairRouterPlugin::new(tracker, 1.0, 64.0, 1.0, 0.0, 0.0);
        let pods = vec![pod("a", 0), pod("b", 0), pod("c", 0)];

        let ctx_light = SchedulingContext::new("m", PromptInput::Text("x".into()), "light", "r1");
        let scores_light = plugin.score(&ctx_light, &pods).await;
        assert!(scores_light["a"] >= scores_light["c"]);

        let ctx_heavy = SchedulingContext::new("m", PromptInput::Text("x".into()), "heavy", "r2");
        let scores_heavy = plugin.score(&ctx_heavy, &pods).await;
        assert!(scores_heavy["c"] >= scores_heavy["a"]);
    }

    #[tokio::test]
    async fn identical_raw_scores_all_100() {
        let tracker = Arc::new(TokenTracker::new(60, TimeUnit::Seconds, 1.0, 1.0));
        let plugin = VtcFairRouterPlugin::new(tracker, 1.0, 64.0, 0.0, 0.0, 0.0);
        let ctx = SchedulingContext::new("m", PromptInput::Text("x".into()), "u", "r");
        let scores = plugin.score(&ctx, &[pod("a", 0), pod("b", 0)]).await;
        assert_eq!(scores["a"], 100.0);
        assert_eq!(scores["b"], 100.0);
    }
}
