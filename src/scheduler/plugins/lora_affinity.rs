use async_trait::async_trait;

use crate::scheduler::context::{CandidatePod, SchedulingContext};
use crate::scheduler::plugin::FilterPlugin;

/// Keeps only pods whose loaded-model set already contains the request's
/// model (base or LoRA adapter), so a request never lands on a pod that
/// would have to hot-swap adapters.
pub struct LoraAffinityPlugin;

#[async_trait]
impl FilterPlugin for LoraAffinityPlugin {
    fn name(&self) -> &str {
        "lora-affinity"
    }

    async fn filter(&self, ctx: &SchedulingContext, pods: Vec<CandidatePod>) -> Vec<CandidatePod> {
        pods.into_iter()
            .filter(|p| p.models.contains(&ctx.model))
            .collect()
    }
}
