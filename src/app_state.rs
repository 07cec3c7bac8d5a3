use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::config::RouterConfig;
use crate::core::cache::backend::LocalKvBackend;
use crate::core::cache::{KvBackend, PrefixCacheStore};
use crate::core::datastore::{key_str, Datastore, VllmEngineAdapter};
use crate::core::queue::PriorityQueue;
use crate::core::tokenizer::{ChatMessage as TokenizerChatMessage, TokenizeInput, TokenizerPool};
use crate::core::tracker::TokenTracker;
use crate::scheduler::pd::PdSelector;
use crate::scheduler::pipeline::{SchedulingPipeline, WeightedScorer};
use crate::scheduler::plugins::{
    GpuCachePlugin, LeastLatencyPlugin, LeastRequestPlugin, LoraAffinityPlugin, PrefixCachePlugin,
    RandomPlugin, VtcFairRouterPlugin,
};
use crate::scheduler::post_hooks::PrefixCacheRecorderHook;
use crate::scheduler::registry::PluginRegistry;
use crate::scheduler::{CandidatePod, PromptInput, ScheduleDecision, SchedulingContext};

/// Everything the admin HTTP surface and background task runner share,
/// built once at startup from `RouterConfig`. Mirrors the teacher's
/// `build_app_state` assembly step, but wires the scheduling framework
/// (datastore, caches, pipelines) instead of the cost-reporting services.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RouterConfig>,
    pub datastore: Arc<Datastore>,
    pub prefix_cache: Arc<PrefixCacheStore>,
    pub kv_backend: Arc<dyn KvBackend>,
    pub token_tracker: Arc<TokenTracker>,
    pub priority_queue: Arc<PriorityQueue>,
    pub tokenizer_pool: Arc<TokenizerPool>,
    pub registry: Arc<PluginRegistry>,
    decode_pipeline: Arc<SchedulingPipeline>,
    prefill_pipeline: Arc<SchedulingPipeline>,
    pd_selector: Arc<PdSelector>,
}

/// Resolve the backend the `kv-cache` plugin should query: a Redis-backed
/// store when `redis_url` is configured and the crate was built with the
/// `redis-backend` feature, otherwise the same local backend `prefix-cache`
/// uses. A Redis client that fails to construct falls back to local too -
/// SPEC_FULL.md §4.3 treats an absent/unreachable distributed store as a
/// local-store fallback, not a startup failure.
#[cfg(feature = "redis-backend")]
fn distributed_kv_backend(cfg: &RouterConfig, local: &Arc<dyn KvBackend>) -> Arc<dyn KvBackend> {
    let Some(redis_url) = cfg.redis_url.as_deref() else {
        return local.clone();
    };
    match crate::core::cache::backend::redis_impl::RedisKvBackend::new(redis_url, cfg.redis_key_prefix.clone()) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::warn!(error = %e, "failed to build redis kv-cache backend, falling back to local store");
            local.clone()
        }
    }
}

#[cfg(not(feature = "redis-backend"))]
fn distributed_kv_backend(_cfg: &RouterConfig, local: &Arc<dyn KvBackend>) -> Arc<dyn KvBackend> {
    local.clone()
}

/// Assemble the default plugin registry: one filter/score factory per
/// plugin named in SPEC_FULL.md §4.8, closing over the shared services
/// each plugin needs. Config-driven weights are read at build time, not
/// from the (currently unused) per-call JSON blob, since this router has
/// no dynamic per-request plugin config - just the fixed startup set.
fn build_registry(
    cfg: &RouterConfig,
    tracker: Arc<TokenTracker>,
    kv_backend: Arc<dyn KvBackend>,
) -> PluginRegistry {
    let registry = PluginRegistry::new();

    let max_waiting = cfg.max_waiting_requests;
    registry
        .register_filter(
            "least-request",
            Box::new(move |_: &Value| Ok(Arc::new(LeastRequestPlugin::new(max_waiting)) as _)),
        )
        .expect("registry open at startup");
    registry
        .register_score(
            "least-request",
            Box::new(move |_: &Value| Ok(Arc::new(LeastRequestPlugin::new(max_waiting)) as _)),
        )
        .expect("registry open at startup");

    registry
        .register_filter("lora-affinity", Box::new(|_: &Value| Ok(Arc::new(LoraAffinityPlugin) as _)))
        .expect("registry open at startup");

    let ttft_tpot_weight_factor = cfg.ttft_tpot_weight_factor;
    registry
        .register_score(
            "least-latency",
            Box::new(move |_: &Value| Ok(Arc::new(LeastLatencyPlugin::new(ttft_tpot_weight_factor)) as _)),
        )
        .expect("registry open at startup");

    registry
        .register_score("gpu-cache", Box::new(|_: &Value| Ok(Arc::new(GpuCachePlugin) as _)))
        .expect("registry open at startup");

    registry
        .register_score("random", Box::new(|_: &Value| Ok(Arc::new(RandomPlugin) as _)))
        .expect("registry open at startup");

    let block_size_to_hash = cfg.block_size_to_hash;
    let max_blocks_to_match = cfg.max_blocks_to_match;
    let backend_for_prefix = kv_backend.clone();
    registry
        .register_score(
            "prefix-cache",
            Box::new(move |_: &Value| {
                Ok(Arc::new(PrefixCachePlugin::new(
                    backend_for_prefix.clone(),
                    block_size_to_hash,
                    max_blocks_to_match,
                )) as _)
            }),
        )
        .expect("registry open at startup");

    // Same scoring logic as `prefix-cache`, but against the distributed
    // backend when one is configured, for multi-replica deployments that
    // share cache-affinity state over Redis. Falls back to the local
    // backend (degenerate single-replica distributed mode) when no Redis
    // URL is configured or the feature is compiled out.
    let backend_for_kv_cache = distributed_kv_backend(cfg, &kv_backend);
    registry
        .register_score(
            "kv-cache",
            Box::new(move |_: &Value| {
                Ok(Arc::new(PrefixCachePlugin::new(
                    backend_for_kv_cache.clone(),
                    block_size_to_hash,
                    max_blocks_to_match,
                )) as _)
            }),
        )
        .expect("registry open at startup");

    let vtc_fairness_weight = cfg.vtc_fairness_weight;
    let vtc_utilization_weight = cfg.vtc_utilization_weight;
    let vtc_random_weight = cfg.vtc_random_weight;
    let vtc_min_token_bucket = cfg.vtc_min_token_bucket;
    let vtc_max_load = cfg.vtc_max_load;
    registry
        .register_score(
            "vtc-fair-router",
            Box::new(move |_: &Value| {
                Ok(Arc::new(VtcFairRouterPlugin::new(
                    tracker.clone(),
                    vtc_min_token_bucket,
                    vtc_max_load,
                    vtc_fairness_weight,
                    vtc_utilization_weight,
                    vtc_random_weight,
                )) as _)
            }),
        )
        .expect("registry open at startup");

    registry.mark_started();
    registry
}

/// The default pipeline plugin set: lora-affinity + least-request filters,
/// every scorer weighted equally except `random`, which exists mainly as a
/// tie-breaker/exerciser and is disabled by default.
fn default_pipeline(
    registry: &PluginRegistry,
    post_hooks: Vec<Arc<dyn crate::scheduler::plugin::PostHook>>,
) -> Result<SchedulingPipeline> {
    let filters = vec![
        registry.build_filter("lora-affinity", &Value::Null)?,
        registry.build_filter("least-request", &Value::Null)?,
    ];
    let scorers = vec![
        WeightedScorer::new(registry.build_score("least-request", &Value::Null)?, 1.0),
        WeightedScorer::new(registry.build_score("least-latency", &Value::Null)?, 1.0),
        WeightedScorer::new(registry.build_score("gpu-cache", &Value::Null)?, 1.0),
        WeightedScorer::new(registry.build_score("prefix-cache", &Value::Null)?, 1.0),
        WeightedScorer::new(registry.build_score("vtc-fair-router", &Value::Null)?, 1.0),
        WeightedScorer::new(registry.build_score("random", &Value::Null)?, 0.0),
    ];
    Ok(SchedulingPipeline::new(filters, scorers, post_hooks))
}

pub fn build_app_state(config: RouterConfig) -> Result<AppState> {
    let config = Arc::new(config);

    let engine_adapter = Arc::new(VllmEngineAdapter::new(config.engine_metrics_port));
    let datastore = Arc::new(Datastore::new(engine_adapter));

    let prefix_cache = Arc::new(PrefixCacheStore::new(config.prefix_store_shards, config.max_hash_cache_size));
    let kv_backend: Arc<dyn KvBackend> = Arc::new(LocalKvBackend::new(prefix_cache.clone()));

    let token_tracker = Arc::new(TokenTracker::new(
        config.window_size,
        config.time_unit,
        config.input_token_weight,
        config.output_token_weight,
    ));

    let priority_queue = Arc::new(PriorityQueue::new());
    let tokenizer_pool = Arc::new(TokenizerPool::new(config.tokenizer_port));

    let registry = Arc::new(build_registry(&config, token_tracker.clone(), kv_backend.clone()));

    let post_hooks: Vec<Arc<dyn crate::scheduler::plugin::PostHook>> =
        vec![Arc::new(PrefixCacheRecorderHook::new(prefix_cache.clone()))];
    let decode_pipeline = Arc::new(default_pipeline(&registry, post_hooks)?);
    let prefill_pipeline = Arc::new(default_pipeline(&registry, vec![])?);
    let pd_selector = Arc::new(PdSelector::new(decode_pipeline.clone(), prefill_pipeline.clone()));

    Ok(AppState {
        config,
        datastore,
        prefix_cache,
        kv_backend,
        token_tracker,
        priority_queue,
        tokenizer_pool,
        registry,
        decode_pipeline,
        prefill_pipeline,
        pd_selector,
    })
}

fn to_tokenizer_input(prompt: &PromptInput) -> TokenizeInput {
    match prompt {
        PromptInput::Text(text) => TokenizeInput::Completion(text.clone()),
        PromptInput::Chat(messages) => TokenizeInput::Chat(
            messages
                .iter()
                .map(|m| TokenizerChatMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
        ),
    }
}

impl AppState {
    /// Run one request through the full scheduling path: resolve the
    /// model's destination model-server, build the candidate pod set from
    /// the datastore, tokenize+hash the prompt for prefix-cache scoring,
    /// then dispatch to the PD selector or the plain pipeline depending on
    /// whether the model-server is PD-disaggregated.
    pub async fn schedule(
        &self,
        model: &str,
        prompt: PromptInput,
        user_id: &str,
        request_id: &str,
    ) -> Result<ScheduleDecision> {
        let (ms_key, _is_lora) = self
            .datastore
            .match_model_server(model, &HashMap::new(), "/")
            .ok_or_else(|| anyhow!("no route matches model {model}"))?;
        let (namespace, name) = ms_key
            .split_once('/')
            .ok_or_else(|| anyhow!("malformed model-server key {ms_key}"))?;

        let ms = self
            .datastore
            .get_model_server(namespace, name)
            .ok_or_else(|| anyhow!("model-server {ms_key} vanished between match and lookup"))?;
        let pod_snapshots = self.datastore.get_pods_by_model_server(namespace, name).unwrap_or_default();

        let candidates: HashMap<String, CandidatePod> = pod_snapshots
            .iter()
            .map(|p| {
                let key = key_str(&p.namespace, &p.name);
                (
                    key.clone(),
                    CandidatePod {
                        key,
                        request_waiting_num: p.metrics.request_waiting_num,
                        request_running_num: p.metrics.request_running_num,
                        gpu_cache_usage: p.metrics.gpu_cache_usage,
                        tpot: p.metrics.tpot,
                        ttft: p.metrics.ttft,
                        models: p.models.clone(),
                    },
                )
            })
            .collect();

        let ctx = SchedulingContext::new(model, prompt, user_id, request_id);

        let tokenizer_candidates: Vec<(String, String)> = pod_snapshots
            .iter()
            .map(|p| (key_str(&p.namespace, &p.name), p.record.ip.clone()))
            .collect();
        match self.tokenizer_pool.get_tokenizer(model, &tokenizer_candidates).await {
            Ok(client) => match client.tokenize(to_tokenizer_input(&ctx.prompt)).await {
                Ok(tokens) => {
                    ctx.block_hashes(&tokens, self.config.block_size_to_hash, self.config.max_blocks_to_match);
                }
                Err(e) => {
                    tracing::warn!(error = %e, model, "tokenize failed, scheduling without prefix-cache affinity");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, model, "no tokenizer available, scheduling without prefix-cache affinity");
            }
        }

        let decision = if ms.pd_group.is_some() {
            self.pd_selector
                .select(&ctx, &ms, &candidates)
                .await
                .ok_or_else(|| anyhow!("no decode pod survived filtering for model-server {ms_key}"))?
        } else {
            let mut all: Vec<CandidatePod> = candidates.into_values().collect();
            all.sort_by(|a, b| a.key.cmp(&b.key));
            let winner = self
                .decode_pipeline
                .select(&ctx, all)
                .await
                .ok_or_else(|| anyhow!("no pod survived filtering for model-server {ms_key}"))?;
            ctx.set_decode_pod(winner.key.clone());
            ScheduleDecision {
                decode_pod: winner.key,
                prefill_pod: None,
            }
        };

        self.decode_pipeline.run_post_hooks(&ctx, &decision).await;
        self.token_tracker.update_token_count(user_id, model, 0.0, 0.0);

        Ok(decision)
    }
}
