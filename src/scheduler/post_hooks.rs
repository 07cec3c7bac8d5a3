use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::core::cache::PrefixCacheStore;
use crate::scheduler::context::{ScheduleDecision, SchedulingContext};
use crate::scheduler::plugin::PostHook;

/// Records the request's block hashes against the chosen decode pod so a
/// follow-up request sharing the same prefix scores it higher next time.
/// A no-op if the context never computed any block hashes (e.g. the
/// prefix-cache scorer was disabled for this pipeline).
pub struct PrefixCacheRecorderHook {
    store: Arc<PrefixCacheStore>,
}

impl PrefixCacheRecorderHook {
    pub fn new(store: Arc<PrefixCacheStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PostHook for PrefixCacheRecorderHook {
    fn name(&self) -> &str {
        "prefix-cache-recorder"
    }

    async fn run(&self, ctx: &SchedulingContext, decision: &ScheduleDecision) {
        let hashes = ctx.block_hashes(&[], 0, 0);
        if hashes.is_empty() {
            return;
        }
        self.store.add(&ctx.model, &hashes, &decision.decode_pod);
        if let Some(prefill) = &decision.prefill_pod {
            if prefill != &decision.decode_pod {
                warn!(request_id = %ctx.request_id, "prefill pod set, not recording its own prefix-cache entry");
            }
        }
    }
}
