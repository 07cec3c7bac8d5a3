use std::collections::HashMap;

use async_trait::async_trait;
use rand::Rng;

use crate::scheduler::context::{CandidatePod, SchedulingContext};
use crate::scheduler::plugin::ScorePlugin;

/// Uniform integer score in `[0, 100]`, used as a tie-breaker or to
/// exercise the pipeline without any real signal.
pub struct RandomPlugin;

#[async_trait]
impl ScorePlugin for RandomPlugin {
    fn name(&self) -> &str {
        "random"
    }

    async fn score(&self, _ctx: &SchedulingContext, pods: &[CandidatePod]) -> HashMap<String, f64> {
        let mut rng = rand::thread_rng();
        pods.iter()
            .map(|pod| (pod.key.clone(), rng.gen_range(0..=100) as f64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::context::PromptInput;

    #[tokio::test]
    async fn scores_stay_in_range() {
        let plugin = RandomPlugin;
        let ctx = SchedulingContext::new("m", PromptInput::Text("x".into()), "u", "r");
        let pods: Vec<CandidatePod> = (0..20)
            .map(|i| CandidatePod {
                key: format!("pod-{i}"),
                request_waiting_num: 0,
                request_running_num: 0,
                gpu_cache_usage: 0.0,
                tpot: 0.0,
                ttft: 0.0,
                models: Default::default(),
            })
            .collect();
        let scores = plugin.score(&ctx, &pods).await;
        for v in scores.values() {
            assert!((0.0..=100.0).contains(v));
        }
    }
}
