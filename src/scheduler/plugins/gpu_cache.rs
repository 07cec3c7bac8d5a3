use std::collections::HashMap;

use async_trait::async_trait;

use crate::scheduler::context::{CandidatePod, SchedulingContext};
use crate::scheduler::plugin::ScorePlugin;

/// `100 − gpuCacheUsage`, clipped to `[0, 100]`. Favors pods with the most
/// free KV-cache headroom.
pub struct GpuCachePlugin;

#[async_trait]
impl ScorePlugin for GpuCachePlugin {
    fn name(&self) -> &str {
        "gpu-cache"
    }

    async fn score(&self, _ctx: &SchedulingContext, pods: &[CandidatePod]) -> HashMap<String, f64> {
        pods.iter()
            .map(|pod| (pod.key.clone(), (100.0 - pod.gpu_cache_usage).clamp(0.0, 100.0)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::context::PromptInput;

    fn pod(key: &str, usage: f64) -> CandidatePod {
        CandidatePod {
            key: key.to_string(),
            request_waiting_num: 0,
            request_running_num: 0,
            gpu_cache_usage: usage,
            tpot: 0.0,
            ttft: 0.0,
            models: Default::default(),
        }
    }

    #[tokio::test]
    async fn score_is_inverse_of_usage_and_clipped() {
        let plugin = GpuCachePlugin;
        let ctx = SchedulingContext::new("m", PromptInput::Text("x".into()), "u", "r");
        let scores = plugin.score(&ctx, &[pod("a", 30.0), pod("b", 150.0), pod("c", -10.0)]).await;
        assert_eq!(scores["a"], 70.0);
        assert_eq!(scores["b"], 0.0);
        assert_eq!(scores["c"], 100.0);
    }
}
