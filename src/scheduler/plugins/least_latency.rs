use std::collections::HashMap;

use async_trait::async_trait;

use crate::scheduler::context::{CandidatePod, SchedulingContext};
use crate::scheduler::plugin::ScorePlugin;

/// Scores pods by `ttft + tpot`, normalized within the candidate set so
/// the lowest-latency pod scores 100 and the highest scores 0.
pub struct LeastLatencyPlugin {
    /// `TTFTTPOTWeightFactor`: relative weight of TTFT vs TPOT within the
    /// combined latency figure, in `[0, 1]` (0.5 weights them equally).
    ttft_tpot_weight_factor: f64,
}

impl LeastLatencyPlugin {
    pub fn new(ttft_tpot_weight_factor: f64) -> Self {
        Self {
            ttft_tpot_weight_factor: ttft_tpot_weight_factor.clamp(0.0, 1.0),
        }
    }

    fn latency(&self, pod: &CandidatePod) -> f64 {
        self.ttft_tpot_weight_factor * pod.ttft + (1.0 - self.ttft_tpot_weight_factor) * pod.tpot
    }
}

#[async_trait]
impl ScorePlugin for LeastLatencyPlugin {
    fn name(&self) -> &str {
        "least-latency"
    }

    async fn score(&self, _ctx: &SchedulingContext, pods: &[CandidatePod]) -> HashMap<String, f64> {
        if pods.is_empty() {
            return HashMap::new();
        }
        let latencies: Vec<f64> = pods.iter().map(|p| self.latency(p)).collect();
        let max = latencies.iter().cloned().fold(f64::MIN, f64::max);
        let min = latencies.iter().cloned().fold(f64::MAX, f64::min);

        pods.iter()
            .zip(latencies.iter())
            .map(|(pod, m)| {
                let score = if (max - min).abs() < f64::EPSILON {
                    100.0
                } else {
                    100.0 * (max - m) / (max - min)
                };
                (pod.key.clone(), score)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::context::PromptInput;

    fn pod(key: &str, ttft: f64, tpot: f64) -> CandidatePod {
        CandidatePod {
            key: key.to_string(),
            request_waiting_num: 0,
            request_running_num: 0,
            gpu_cache_usage: 0.0,
            tpot,
            ttft,
            models: Default::default(),
        }
    }

    #[tokio::test]
    async fn fastest_pod_scores_100() {
        let plugin = LeastLatencyPlugin::new(0.5);
        let ctx = SchedulingContext::new("m", PromptInput::Text("x".into()), "u", "r");
        let scores = plugin.score(&ctx, &[pod("fast", 0.01, 0.01), pod("slow", 1.0, 1.0)]).await;
        assert_eq!(scores["fast"], 100.0);
        assert_eq!(scores["slow"], 0.0);
    }

    #[tokio::test]
    async fn identical_latency_scores_100() {
        let plugin = LeastLatencyPlugin::new(0.5);
        let ctx = SchedulingContext::new("m", PromptInput::Text("x".into()), "u", "r");
        let scores = plugin.score(&ctx, &[pod("a", 0.2, 0.2), pod("b", 0.2, 0.2)]).await;
        assert_eq!(scores["a"], 100.0);
        assert_eq!(scores["b"], 100.0);
    }
}
