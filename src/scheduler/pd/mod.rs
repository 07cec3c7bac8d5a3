use std::collections::HashMap;
use std::sync::Arc;

use crate::core::datastore::ModelServer;
use crate::scheduler::context::{CandidatePod, ScheduleDecision, SchedulingContext};
use crate::scheduler::pipeline::SchedulingPipeline;

/// Selects a matched (decode, prefill) pod pair for a prefill/decode
/// disaggregated model-server. Decode candidates are the union of every
/// group's `decodePods`; once a decode winner is chosen, only its own
/// group's `prefillPods` are eligible for the prefill pick.
pub struct PdSelector {
    decode_pipeline: Arc<SchedulingPipeline>,
    prefill_pipeline: Arc<SchedulingPipeline>,
}

impl PdSelector {
    pub fn new(decode_pipeline: Arc<SchedulingPipeline>, prefill_pipeline: Arc<SchedulingPipeline>) -> Self {
        Self {
            decode_pipeline,
            prefill_pipeline,
        }
    }

    /// `all_pods` is keyed by pod key and holds every pod belonging to
    /// `ms`, already converted to scheduling candidates. Returns `None`
    /// only when no decode pod survives filtering.
    pub async fn select(
        &self,
        ctx: &SchedulingContext,
        ms: &ModelServer,
        all_pods: &HashMap<String, CandidatePod>,
    ) -> Option<ScheduleDecision> {
        let decode_keys: std::collections::HashSet<&String> =
            ms.pd_groups.values().flat_map(|g| g.decode_pods.iter()).collect();
        let decode_candidates: Vec<CandidatePod> = decode_keys
            .into_iter()
            .filter_map(|k| all_pods.get(k).cloned())
            .collect();

        let decode_winner = self.decode_pipeline.select(ctx, decode_candidates).await?;
        ctx.set_decode_pod(decode_winner.key.clone());

        let group_value = ms
            .pd_groups
            .iter()
            .find(|(_, pods)| pods.decode_pods.contains(&decode_winner.key))
            .map(|(group, _)| group.clone());

        let prefill_winner = match group_value {
            Some(group) => {
                let prefill_keys = &ms.pd_groups[&group].prefill_pods;
                let prefill_candidates: Vec<CandidatePod> = prefill_keys
                    .iter()
                    .filter_map(|k| all_pods.get(k).cloned())
                    .collect();
                self.prefill_pipeline.select(ctx, prefill_candidates).await
            }
            None => None,
        };

        if let Some(pod) = &prefill_winner {
            ctx.set_prefill_pod(pod.key.clone());
        }

        Some(ScheduleDecision {
            decode_pod: decode_winner.key,
            prefill_pod: prefill_winner.map(|p| p.key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::datastore::{PdGroupPods, PdGroupSpec};
    use crate::scheduler::context::PromptInput;
    use crate::scheduler::plugin::{FilterPlugin, ScorePlugin};
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

    fn pipeline_favoring(key: &str) -> Arc<SchedulingPipeline> {
        let mut scores = HashMap::new();
        scores.insert(key.to_string(), 100.0);
        Arc::new(SchedulingPipeline::new(
            vec![Arc::new(AllPassFilter)],
            vec![crate::scheduler::pipeline::WeightedScorer::new(Arc::new(FixedScorer(scores)), 1.0)],
            vec![],
        ))
    }

    #[tokio::test]
    async fn pairs_decode_with_its_own_group_prefill() {
        let mut ms = ModelServer::new("ns", "ms1");
        ms.pd_group = Some(PdGroupSpec {
            group_key: "pd-group".into(),
            decode_labels: HashMap::new(),
            prefill_labels: HashMap::new(),
        });
        ms.pd_groups.insert(
            "g1".into(),
            PdGroupPods {
                decode_pods: ["d1".to_string()].into_iter().collect(),
                prefill_pods: ["p1".to_string()].into_iter().collect(),
            },
        );
        ms.pd_groups.insert(
            "g2".into(),
            PdGroupPods {
                decode_pods: ["d2".to_string()].into_iter().collect(),
                prefill_pods: ["p2".to_string()].into_iter().collect(),
            },
        );

        let mut all_pods = HashMap::new();
        for key in ["d1", "d2", "p1", "p2"] {
            all_pods.insert(key.to_string(), pod(key));
        }

        let selector = PdSelector::new(pipeline_favoring("d1"), pipeline_favoring("p2"));
        let ctx = SchedulingContext::new("m1", PromptInput::Text("x".into()), "u1", "r1");
        let decision = selector.select(&ctx, &ms, &all_pods).await.unwrap();
        assert_eq!(decision.decode_pod, "d1");
        assert_eq!(decision.prefill_pod, Some("p1".to_string()));
    }

    #[tokio::test]
    async fn no_decode_candidates_returns_none() {
        let ms = ModelServer::new("ns", "ms1");
        let all_pods = HashMap::new();
        let selector = PdSelector::new(pipeline_favoring("x"), pipeline_favoring("y"));
        let ctx = SchedulingContext::new("m1", PromptInput::Text("x".into()), "u1", "r1");
        assert!(selector.select(&ctx, &ms, &all_pods).await.is_none());
    }
}
