use async_trait::async_trait;
use std::collections::HashMap;

use crate::scheduler::context::{CandidatePod, ScheduleDecision, SchedulingContext};

/// `(ctx, pods) → pods'`. Must be monotone (never grows the candidate set)
/// and must not mutate the pods it's given.
#[async_trait]
pub trait FilterPlugin: Send + Sync {
    fn name(&self) -> &str;
    async fn filter(&self, ctx: &SchedulingContext, pods: Vec<CandidatePod>) -> Vec<CandidatePod>;
}

/// `(ctx, pods) → map<pod, score∈[0,100]>`. Plugins that can't score a pod
/// simply omit it from the map; the framework treats a missing entry as 0.
#[async_trait]
pub trait ScorePlugin: Send + Sync {
    fn name(&self) -> &str;
    async fn score(&self, ctx: &SchedulingContext, pods: &[CandidatePod]) -> HashMap<String, f64>;
}

/// `(ctx)`, invoked once with the final selection after a pipeline run.
#[async_trait]
pub trait PostHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &SchedulingContext, decision: &ScheduleDecision);
}
