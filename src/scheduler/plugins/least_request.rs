use std::collections::HashMap;

use async_trait::async_trait;

use crate::scheduler::context::{CandidatePod, SchedulingContext};
use crate::scheduler::plugin::{FilterPlugin, ScorePlugin};

/// Filters out pods with too many queued requests, then scores survivors
/// by `running + 2·waiting`, linearly mapped so the lightest-loaded pod
/// scores 100 and the heaviest scores 0.
pub struct LeastRequestPlugin {
    max_waiting: u64,
}

impl LeastRequestPlugin {
    pub fn new(max_waiting: u64) -> Self {
        Self { max_waiting }
    }

    fn base_load(pod: &CandidatePod) -> f64 {
        pod.request_running_num as f64 + 2.0 * pod.request_waiting_num as f64
    }
}

#[async_trait]
impl FilterPlugin for LeastRequestPlugin {
    fn name(&self) -> &str {
        "least-request"
    }

    async fn filter(&self, _ctx: &SchedulingContext, pods: Vec<CandidatePod>) -> Vec<CandidatePod> {
        pods.into_iter()
            .filter(|p| p.request_waiting_num < self.max_waiting)
            .collect()
    }
}

#[async_trait]
impl ScorePlugin for LeastRequestPlugin {
    fn name(&self) -> &str {
        "least-request"
    }

    async fn score(&self, _ctx: &SchedulingContext, pods: &[CandidatePod]) -> HashMap<String, f64> {
        if pods.is_empty() {
            return HashMap::new();
        }
        let bases: Vec<f64> = pods.iter().map(Self::base_load).collect();
        let max = bases.iter().cloned().fold(f64::MIN, f64::max);
        let min = bases.iter().cloned().fold(f64::MAX, f64::min);

        pods.iter()
            .zip(bases.iter())
            .map(|(pod, base)| {
                let score = if (max - min).abs() < f64::EPSILON {
                    100.0
                } else {
                    100.0 * (max - base) / (max - min)
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

    fn pod(key: &str, waiting: u64, running: u64) -> CandidatePod {
        CandidatePod {
            key: key.to_string(),
            request_waiting_num: waiting,
            request_running_num: running,
            gpu_cache_usage: 0.0,
            tpot: 0.0,
            ttft: 0.0,
            models: Default::default(),
        }
    }

    #[tokio::test]
    async fn filter_drops_overloaded_pods() {
        let plugin = LeastRequestPlugin::new(5);
        let ctx = SchedulingContext::new("m", PromptInput::Text("x".into()), "u", "r");
        let survivors = plugin.filter(&ctx, vec![pod("a", 2, 0), pod("b", 10, 0)]).await;
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].key, "a");
    }

    #[tokio::test]
    async fn score_favors_lighter_pod() {
        let plugin = LeastRequestPlugin::new(100);
        let ctx = SchedulingContext::new("m", PromptInput::Text("x".into()), "u", "r");
        let scores = plugin.score(&ctx, &[pod("a", 0, 0), pod("b", 5, 5)]).await;
        assert_eq!(scores["a"], 100.0);
        assert!(scores["b"] < scores["a"]);
    }

    #[tokio::test]
    async fn identical_load_scores_all_100() {
        let plugin = LeastRequestPlugin::new(100);
        let ctx = SchedulingContext::new("m", PromptInput::Text("x".into()), "u", "r");
        let scores = plugin.score(&ctx, &[pod("a", 1, 1), pod("b", 1, 1)]).await;
        assert_eq!(scores["a"], 100.0);
        assert_eq!(scores["b"], 100.0);
    }
}
